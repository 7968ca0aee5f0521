//! Buffer chunks, buffer managers, and domain negotiation.
//!
//! Output ports draw writable space from a [`BufferManager`] chosen per
//! flow: both endpoints expose a memory *domain* string, each block may
//! provide a manager, defer to its peer, or protest, and the framework
//! resolves the result (consumer preferred) or fails the commit with a
//! port-domain error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use millrace_bytes::{Bytes, BytesMut};
use smallvec::SmallVec;

use crate::dtype::DType;
use crate::error::Error;

mod circular;
mod generic;

pub use circular::CircularBufferManager;
pub use generic::GenericBufferManager;

/// Accounts bytes back to a ring allocator when the last chunk view
/// sharing them drops.
pub(crate) struct ReleaseGuard {
    bytes: usize,
    counter: Arc<AtomicU64>,
}

impl ReleaseGuard {
    pub(crate) fn new(bytes: usize, counter: Arc<AtomicU64>) -> Self {
        Self { bytes, counter }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.counter.fetch_add(self.bytes as u64, Ordering::Release);
    }
}

/// A typed view into a shared buffer arena.
///
/// Chunks are cheap to clone and to sub-slice: advancing shrinks the view
/// without returning bytes, and the underlying arena slice becomes
/// reusable only when every view sharing it has dropped.
#[derive(Clone)]
pub struct BufferChunk {
    bytes: Bytes,
    dtype: DType,
    /// Valid bytes physically preceding the view in the same arena.
    history: usize,
    guards: SmallVec<[Arc<ReleaseGuard>; 2]>,
}

impl BufferChunk {
    /// Wraps a byte view with an element type.
    pub fn new(bytes: Bytes, dtype: DType) -> Self {
        Self {
            bytes,
            dtype,
            history: 0,
            guards: SmallVec::new(),
        }
    }

    /// A chunk owning a fresh copy of `data`.
    pub fn from_vec(data: Vec<u8>, dtype: DType) -> Self {
        let len = data.len();
        let mut alloc = BytesMut::from(data.into_boxed_slice());
        Self::new(alloc.extract_to(len), dtype)
    }

    pub(crate) fn with_guard(
        bytes: Bytes,
        dtype: DType,
        history: usize,
        guard: Arc<ReleaseGuard>,
    ) -> Self {
        let mut guards = SmallVec::new();
        guards.push(guard);
        Self {
            bytes,
            dtype,
            history,
            guards,
        }
    }

    /// The view length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True when the view is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The count of whole elements in the view.
    pub fn elements(&self) -> usize {
        if self.dtype.is_empty() {
            0
        } else {
            self.bytes.len() / self.dtype.size()
        }
    }

    /// The element type of the view.
    pub fn dtype(&self) -> &DType {
        &self.dtype
    }

    /// The bytes of the view.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Drops `n` bytes from the front of the view without releasing them.
    pub fn advance(&mut self, n: usize) {
        self.bytes.advance(n);
        self.history += n;
    }

    pub(crate) fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub(crate) fn history(&self) -> usize {
        self.history
    }

    /// Absorbs `other` if it physically continues this view.
    pub(crate) fn try_merge(&mut self, other: BufferChunk) -> Result<(), BufferChunk> {
        let BufferChunk {
            bytes,
            dtype,
            history,
            guards,
        } = other;
        match self.bytes.try_merge(bytes) {
            Ok(()) => {
                self.guards.extend(guards);
                Ok(())
            }
            Err(bytes) => Err(BufferChunk {
                bytes,
                dtype,
                history,
                guards,
            }),
        }
    }

    /// Grows the view backwards over `n` bytes of stamped history.
    ///
    /// Ring managers guarantee that a chunk's history bytes physically
    /// precede it and replicate the most recently produced stream bytes,
    /// so a consumer can rebase an unconsumed window across the wrap.
    pub(crate) fn rebase_over(&mut self, n: usize) -> bool {
        if n > self.history {
            return false;
        }
        unsafe {
            self.bytes.expand_front(n);
        }
        self.history -= n;
        true
    }
}

impl std::fmt::Debug for BufferChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferChunk")
            .field("len", &self.len())
            .field("dtype", &self.dtype.name())
            .finish()
    }
}

/// A producer of writable buffer space for one output port.
///
/// Managers never block: when no space can be handed out the writable
/// region is empty and the owning actor parks until a downstream consume
/// frees chunks.
pub trait BufferManager: Send {
    /// The memory domain this manager allocates from.
    fn domain(&self) -> &str;

    /// The writable region for the next produce; empty under back-pressure.
    fn writable(&mut self) -> &mut [u8];

    /// Commits the first `bytes` of the writable region as a chunk.
    ///
    /// Panics when `bytes` exceeds the writable region; output ports
    /// validate before calling.
    fn extract(&mut self, bytes: usize, dtype: &DType) -> BufferChunk;

    /// Attempts to reclaim storage returned by downstream consumers.
    fn reclaim(&mut self);
}

impl std::fmt::Debug for dyn BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager").field("domain", &self.domain()).finish()
    }
}

/// The default manager for a producer domain.
pub(crate) fn default_manager(
    src_domain: &str,
    dst_domain: &str,
) -> Result<Box<dyn BufferManager>, Error> {
    match src_domain {
        "" | "default" => Ok(Box::new(GenericBufferManager::default())),
        "circular" => Ok(Box::new(CircularBufferManager::default())),
        other => Err(Error::PortDomain {
            src_domain: other.to_owned(),
            dst_domain: dst_domain.to_owned(),
            reason: "no default buffer manager for this domain".to_owned(),
        }),
    }
}

/// Applies the negotiation rules to the managers offered by both sides.
pub(crate) fn resolve_manager(
    src_domain: &str,
    dst_domain: &str,
    from_producer: Option<Box<dyn BufferManager>>,
    from_consumer: Option<Box<dyn BufferManager>>,
) -> Result<Box<dyn BufferManager>, Error> {
    // The consumer's manager wins when both sides provide one: it knows
    // what the consumer can cheaply read.
    match (from_producer, from_consumer) {
        (_, Some(manager)) => Ok(manager),
        (Some(manager), None) => Ok(manager),
        (None, None) => default_manager(src_domain, dst_domain),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_advance_keeps_arena_alive() {
        let mut chunk = BufferChunk::from_vec(vec![1, 2, 3, 4], DType::u8());
        chunk.advance(2);
        assert_eq!(chunk.as_slice(), &[3, 4]);
        assert_eq!(chunk.elements(), 2);
    }

    #[test]
    fn default_manager_by_domain() {
        assert!(default_manager("", "").is_ok());
        assert!(default_manager("circular", "").is_ok());
        let err = default_manager("cuda", "host").unwrap_err();
        match err {
            Error::PortDomain {
                src_domain,
                dst_domain,
                ..
            } => {
                assert_eq!(src_domain, "cuda");
                assert_eq!(dst_domain, "host");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn consumer_manager_preferred() {
        let produced: Box<dyn BufferManager> = Box::new(GenericBufferManager::new(64, 2));
        let consumed: Box<dyn BufferManager> =
            Box::new(GenericBufferManager::with_domain("special", 64, 2));
        let chosen = resolve_manager("", "", Some(produced), Some(consumed)).unwrap();
        assert_eq!(chosen.domain(), "special");
    }
}
