//! The mVRL framing codec and the serializer/deserializer blocks.
//!
//! mVRL is a length-prefixed framing of stream buffers, labels, and
//! messages over a byte transport. Frames are boundary-recoverable: a
//! resynchronizing scanner finds frame starts byte-by-byte, so lost or
//! corrupted stretches cost frames, never the connection.

mod blocks;
mod frame;

pub use blocks::{Deserializer, Serializer};
pub use frame::{
    FrameDecoder, FrameEncoder, WireEvent, END_MAGIC, FRAME_MAGIC, MAX_FRAME_BYTES,
    MIN_FRAME_BYTES,
};

use crate::object::Value;
use crate::runtime::Runtime;

/// Registers the built-in block factories.
pub(crate) fn register_builtin_blocks(runtime: &Runtime) {
    runtime.register_factory("/blocks/serializer", |rt, args: &[Value]| {
        let ports = args.first().and_then(Value::as_int).unwrap_or(1).max(1) as usize;
        rt.register(Serializer::new(ports))
    });
    runtime.register_factory("/blocks/deserializer", |rt, args: &[Value]| {
        let ports = args.first().and_then(Value::as_int).unwrap_or(1).max(1) as usize;
        rt.register(Deserializer::new(ports))
    });
}
