//! Millrace is a block dataflow runtime.
//!
//! Users declare computation as a directed graph of *blocks* connected by
//! typed ports, possibly nested inside sub-topologies that act as
//! pass-through containers. Committing a [`Topology`] flattens the graph to
//! flows over real block ports, negotiates a buffer manager for every
//! stream flow, and schedules each block's `work()` on a thread pool
//! through a per-block actor. Streams carry reference-counted buffer
//! chunks annotated with indexed [`Label`]s; out-of-band [`Value`] messages
//! ride bounded per-port queues. The [`codec`] module frames streams,
//! labels, and messages into the mVRL byte format for transport edges.
//!
//! # Examples
//!
//! ```no_run
//! use millrace::{Runtime, Topology};
//! use std::time::Duration;
//!
//! let runtime = Runtime::new();
//! let source = runtime.make("/blocks/serializer", &[]).unwrap();
//! let sink = runtime.make("/blocks/deserializer", &[]).unwrap();
//!
//! let topology = Topology::new(&runtime);
//! topology.connect(&source, "0", &sink, "0").unwrap();
//! topology.commit().unwrap();
//! topology.wait_inactive(Duration::from_millis(100), Duration::from_secs(1));
//! ```

pub mod buffer;
pub mod codec;
pub mod port;
pub mod topology;

mod actor;
mod block;
mod dtype;
mod error;
mod label;
mod object;
mod pool;
mod runtime;

pub use crate::block::{default_label_propagation, Block, BlockSetup, WorkInfo, WorkIo};
pub use crate::dtype::DType;
pub use crate::error::Error;
pub use crate::label::Label;
pub use crate::object::{ArgKind, CallReturn, Value};
pub use crate::pool::{ThreadPool, ThreadPoolArgs, YieldMode};
pub use crate::runtime::{BlockHandle, Runtime, Uid};
pub use crate::topology::{Connector, DumpMode, Topology};
