//! The circular (history-preserving) ring manager.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use millrace_bytes::BytesMut;

use crate::buffer::{BufferChunk, BufferManager, ReleaseGuard};
use crate::dtype::DType;

const DEFAULT_RING_BYTES: usize = 64 * 1024;
const DEFAULT_EPSILON: usize = 4 * 1024;

/// A sequentially written ring of `2N` bytes for consumers that hold a
/// sliding window.
///
/// Chunks are carved in stream order from one arena, so successive chunks
/// are physically contiguous and merge without copying. At the physical
/// wrap the most recent ε bytes are replicated into the arena headroom and
/// the write cursor rebases past them: every chunk is stamped with the
/// history bytes preceding it, and a consumer holding a window of up to ε
/// unconsumed bytes rebases over the wrap without observing a
/// discontinuity.
///
/// Byte accounting rides on chunk drop guards. In-flight bytes are capped
/// at `N` and single chunks at `N/4`, which keeps new writes disjoint from
/// every outstanding view; the bound assumes consumers release views in
/// stream order, which the input-port accumulator does.
pub struct CircularBufferManager {
    domain: String,
    arena: BytesMut,
    half: usize,
    epsilon: usize,
    write: usize,
    handed: u64,
    released: Arc<AtomicU64>,
}

impl CircularBufferManager {
    /// A ring of `ring_bytes` usable bytes preserving `epsilon` bytes of
    /// history across the wrap. `epsilon` is clamped to `ring_bytes / 4`.
    pub fn new(ring_bytes: usize, epsilon: usize) -> Self {
        assert!(ring_bytes >= 16);
        Self {
            domain: "circular".to_owned(),
            arena: BytesMut::zeroed(2 * ring_bytes),
            half: ring_bytes,
            epsilon: epsilon.min(ring_bytes / 4),
            write: 0,
            handed: 0,
            released: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The usable ring size in bytes.
    pub fn ring_bytes(&self) -> usize {
        self.half
    }

    /// The history preserved across the wrap, in bytes.
    pub fn epsilon(&self) -> usize {
        self.epsilon
    }

    fn max_chunk(&self) -> usize {
        self.half / 4
    }

    fn in_flight(&self) -> u64 {
        self.handed - self.released.load(Ordering::Acquire)
    }

    /// Replicates the trailing history into the headroom and rebases the
    /// write cursor behind it.
    fn wrap(&mut self) {
        let history = self.epsilon.min(self.write);
        if history > 0 {
            let start = self.write - history;
            let end = self.write;
            self.arena.copy_within(start..end, 0);
        }
        self.write = history;
    }
}

impl Default for CircularBufferManager {
    fn default() -> Self {
        Self::new(DEFAULT_RING_BYTES, DEFAULT_EPSILON)
    }
}

impl BufferManager for CircularBufferManager {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn writable(&mut self) -> &mut [u8] {
        let in_flight = self.in_flight();
        if in_flight >= self.half as u64 {
            return &mut [];
        }
        if self.write + self.max_chunk() > 2 * self.half {
            self.wrap();
        }
        let budget = (self.half as u64 - in_flight) as usize;
        let len = self
            .max_chunk()
            .min(budget)
            .min(2 * self.half - self.write);
        let start = self.write;
        &mut self.arena[start..start + len]
    }

    fn extract(&mut self, bytes: usize, dtype: &DType) -> BufferChunk {
        let history = self.epsilon.min(self.write);
        let view = unsafe { self.arena.view(self.write, bytes) };
        let guard = Arc::new(ReleaseGuard::new(bytes, Arc::clone(&self.released)));
        self.write += bytes;
        self.handed += bytes as u64;
        BufferChunk::with_guard(view, dtype.clone(), history, guard)
    }

    fn reclaim(&mut self) {
        // Accounting is pushed by chunk drops; nothing to pull.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(manager: &mut CircularBufferManager, len: usize, value: u8) -> BufferChunk {
        let writable = manager.writable();
        assert!(writable.len() >= len);
        for b in writable[..len].iter_mut() {
            *b = value;
        }
        manager.extract(len, &DType::u8())
    }

    #[test]
    fn back_pressure_at_capacity() {
        let mut manager = CircularBufferManager::new(64, 8);
        let mut held = Vec::new();
        while !manager.writable().is_empty() {
            let len = manager.writable().len();
            held.push(manager.extract(len, &DType::u8()));
        }
        assert!(manager.in_flight() >= 64 - 16);
        held.clear();
        assert!(!manager.writable().is_empty());
    }

    #[test]
    fn sequential_chunks_merge() {
        let mut manager = CircularBufferManager::new(1024, 64);
        let mut first = fill(&mut manager, 16, 0xAA);
        let second = fill(&mut manager, 16, 0xBB);
        first.try_merge(second).ok().unwrap();
        assert_eq!(first.len(), 32);
        assert_eq!(first.as_slice()[15], 0xAA);
        assert_eq!(first.as_slice()[16], 0xBB);
    }

    #[test]
    fn history_survives_the_wrap() {
        let mut manager = CircularBufferManager::new(64, 16);
        // Run the cursor close to the physical end, releasing as we go.
        for round in 0..10 {
            let chunk = fill(&mut manager, 16, round as u8);
            drop(chunk);
        }
        // The next chunk may start past the wrap; its stamped history must
        // replicate the most recent bytes.
        let chunk = fill(&mut manager, 16, 0xCC);
        let history = chunk.history();
        assert!(history >= 9, "expected history, got {history}");
        let mut rebased = chunk.clone();
        assert!(rebased.rebase_over(8));
        // The 8 rebased bytes replicate the tail of the previous round.
        assert_eq!(rebased.as_slice()[..8], [9u8; 8]);
        assert_eq!(rebased.as_slice()[8..], [0xCC; 16]);
    }
}
