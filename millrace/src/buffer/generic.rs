//! The fixed-size slab pool manager.

use millrace_bytes::BytesMut;

use crate::buffer::{BufferChunk, BufferManager};
use crate::dtype::DType;

const DEFAULT_SLAB_BYTES: usize = 32 * 1024;
const DEFAULT_SLAB_COUNT: usize = 8;

/// A pool of equally sized slabs.
///
/// Writes land in the current slab; committed bytes are extracted off its
/// front as shared chunks. An exhausted slab is retired until every chunk
/// carved from it has dropped, at which point it regenerates into the
/// stash. With the whole pool in flight the writable region is empty and
/// the producer experiences back-pressure.
pub struct GenericBufferManager {
    domain: String,
    current: BytesMut,
    retired: Vec<BytesMut>,
    stash: Vec<BytesMut>,
    slab_bytes: usize,
}

impl GenericBufferManager {
    /// A pool of `slab_count` slabs of `slab_bytes` each, domain `default`.
    pub fn new(slab_bytes: usize, slab_count: usize) -> Self {
        Self::with_domain("default", slab_bytes, slab_count)
    }

    /// A pool allocating for the given domain.
    pub fn with_domain(domain: &str, slab_bytes: usize, slab_count: usize) -> Self {
        assert!(slab_bytes > 0);
        assert!(slab_count > 0);
        let mut stash: Vec<BytesMut> = (0..slab_count)
            .map(|_| BytesMut::zeroed(slab_bytes))
            .collect();
        let current = stash.pop().unwrap_or_else(|| BytesMut::zeroed(slab_bytes));
        Self {
            domain: domain.to_owned(),
            current,
            retired: Vec::new(),
            stash,
            slab_bytes,
        }
    }

    /// The slab size in bytes.
    pub fn slab_bytes(&self) -> usize {
        self.slab_bytes
    }

    /// Swaps in a fresh slab when the current one is exhausted.
    fn roll(&mut self) {
        if !self.current.is_empty() {
            return;
        }
        if self.current.try_regenerate() {
            return;
        }
        self.reclaim();
        if let Some(next) = self.stash.pop() {
            let exhausted = std::mem::replace(&mut self.current, next);
            self.retired.push(exhausted);
        }
    }
}

impl Default for GenericBufferManager {
    fn default() -> Self {
        Self::new(DEFAULT_SLAB_BYTES, DEFAULT_SLAB_COUNT)
    }
}

impl BufferManager for GenericBufferManager {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn writable(&mut self) -> &mut [u8] {
        if self.current.is_empty() {
            self.roll();
        }
        &mut self.current[..]
    }

    fn extract(&mut self, bytes: usize, dtype: &DType) -> BufferChunk {
        BufferChunk::new(self.current.extract_to(bytes), dtype.clone())
    }

    fn reclaim(&mut self) {
        let mut index = 0;
        while index < self.retired.len() {
            if self.retired[index].try_regenerate() {
                let slab = self.retired.swap_remove(index);
                self.stash.push(slab);
            } else {
                index += 1;
            }
        }
    }
}
