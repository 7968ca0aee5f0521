//! The error type shared by every framework API.

use thiserror::Error;

/// Failure kinds distinguished by the framework.
///
/// Errors raised inside user `work()` fail that block only; errors raised
/// by `commit` are synchronous and leave the topology unchanged; framing
/// errors are logged and the affected frame is skipped.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// A referenced port name does not exist on a block.
    #[error("block {block} has no port named {port:?}")]
    PortAccess {
        /// Display name of the block.
        block: String,
        /// The missing port name.
        port: String,
    },

    /// Buffer domain negotiation between two ports failed.
    #[error("buffer domain negotiation failed between source domain {src_domain:?} and destination domain {dst_domain:?}: {reason}")]
    PortDomain {
        /// The producer port's memory domain.
        src_domain: String,
        /// The consumer port's memory domain.
        dst_domain: String,
        /// What went wrong.
        reason: String,
    },

    /// Multi-drive, duplicate flow, unknown block id, or a malformed
    /// connection request.
    #[error("topology connect: {0}")]
    TopologyConnect(String),

    /// Opaque call dispatch found no matching handler.
    #[error("block {block} has no call named {call:?}")]
    BlockCallNotFound {
        /// Display name of the block.
        block: String,
        /// The requested call name.
        call: String,
    },

    /// A frame inconsistency or a produce/consume overrun.
    #[error("assertion violated: {0}")]
    Assertion(String),

    /// Malformed topology description.
    #[error("data format: {0}")]
    DataFormat(String),

    /// Any other runtime failure.
    #[error("runtime: {0}")]
    Runtime(String),
}

impl Error {
    pub(crate) fn assertion(message: impl Into<String>) -> Self {
        Error::Assertion(message.into())
    }

    pub(crate) fn runtime(message: impl Into<String>) -> Self {
        Error::Runtime(message.into())
    }

    pub(crate) fn connect(message: impl Into<String>) -> Self {
        Error::TopologyConnect(message.into())
    }

    pub(crate) fn data_format(message: impl Into<String>) -> Self {
        Error::DataFormat(message.into())
    }

    pub(crate) fn no_port(block: impl Into<String>, port: impl Into<String>) -> Self {
        Error::PortAccess {
            block: block.into(),
            port: port.into(),
        }
    }

    pub(crate) fn no_call(block: impl Into<String>, call: impl Into<String>) -> Self {
        Error::BlockCallNotFound {
            block: block.into(),
            call: call.into(),
        }
    }
}
