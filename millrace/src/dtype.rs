//! Element data types carried by streaming ports.

use serde::{Deserialize, Serialize};

/// A port element type: a display name plus the element size in bytes.
///
/// Message-only ports (signals, slots, and ports that never carry stream
/// data) use the empty dtype, whose size is zero.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DType {
    name: String,
    size: usize,
}

impl DType {
    /// A dtype with the given display name and element size in bytes.
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    /// The empty dtype used by message-only ports.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Single byte elements.
    pub fn u8() -> Self {
        Self::new("u8", 1)
    }

    /// 32-bit float elements.
    pub fn f32() -> Self {
        Self::new("f32", 4)
    }

    /// The display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The element size in bytes; zero for the empty dtype.
    pub fn size(&self) -> usize {
        self.size
    }

    /// True for the empty (message-only) dtype.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}
