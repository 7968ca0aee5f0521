//! Input and output ports: the per-port state exposed to `work()`.

mod inbox;
mod input;
mod output;

pub(crate) use inbox::InputInbox;
pub(crate) use output::Subscriber;

pub use input::InputPort;
pub use output::OutputPort;

use serde::Serialize;

use crate::dtype::DType;

/// Displayable information about one port.
#[derive(Clone, Debug, Serialize)]
pub struct PortInfo {
    /// The port name; decimal names are also indexed.
    pub name: String,
    /// Display rename, when set.
    pub alias: Option<String>,
    /// Element type; empty for message-only ports.
    pub dtype: DType,
    /// Memory domain of buffers on this port.
    pub domain: String,
    /// True for signal (output) and slot (input) ports.
    pub sig_slot: bool,
}
