//! Input port state and accounting.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use crate::actor::ActorCell;
use crate::buffer::BufferChunk;
use crate::dtype::DType;
use crate::error::Error;
use crate::label::Label;
use crate::object::Value;
use crate::port::{InputInbox, PortInfo};
use crate::runtime::Uid;

/// An input port: a stream buffer view, a labels window, and a message
/// queue, with consume accounting.
pub struct InputPort {
    name: String,
    index: Option<usize>,
    alias: Option<String>,
    dtype: DType,
    domain: String,
    is_slot: bool,
    reserve_bytes: usize,
    queue: VecDeque<BufferChunk>,
    /// Pending labels in absolute element indices, in arrival order.
    labels: VecDeque<Label>,
    messages: VecDeque<Value>,
    /// Labels from the consumed window, staged for propagation.
    consumed_labels: Vec<Label>,
    total_bytes: u64,
    total_messages: u64,
    consumed_this_work: usize,
    work_entry_elements: u64,
    upstream: Option<(Uid, Weak<ActorCell>)>,
    inbox: Arc<InputInbox>,
}

impl InputPort {
    pub(crate) fn new(
        name: String,
        dtype: DType,
        domain: String,
        is_slot: bool,
        inbox: Arc<InputInbox>,
    ) -> Self {
        let index = name.parse::<usize>().ok();
        Self {
            name,
            index,
            alias: None,
            dtype,
            domain,
            is_slot,
            reserve_bytes: 0,
            queue: VecDeque::new(),
            labels: VecDeque::new(),
            messages: VecDeque::new(),
            consumed_labels: Vec::new(),
            total_bytes: 0,
            total_messages: 0,
            consumed_this_work: 0,
            work_entry_elements: 0,
            upstream: None,
            inbox,
        }
    }

    /// The port name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The numeric index for ports with decimal names.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    /// The element type.
    pub fn dtype(&self) -> &DType {
        &self.dtype
    }

    /// The expected memory domain.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// True for slot ports.
    pub fn is_slot(&self) -> bool {
        self.is_slot
    }

    /// The count of whole elements currently visible in the buffer.
    pub fn elements(&self) -> usize {
        if self.dtype.is_empty() {
            return 0;
        }
        self.buffer().len() / self.dtype.size()
    }

    /// The bytes of the head buffer view.
    pub fn buffer(&self) -> &[u8] {
        self.queue.front().map(|c| c.as_slice()).unwrap_or(&[])
    }

    /// The head chunk, when data is queued.
    pub fn chunk(&self) -> Option<&BufferChunk> {
        self.queue.front()
    }

    /// Labels within the current view, with view-relative indices.
    pub fn labels(&self) -> impl Iterator<Item = Label> + '_ {
        let start = self.total_elements();
        let visible = self.elements() as u64;
        self.labels
            .iter()
            .take_while(move |l| l.index < start + visible)
            .map(move |l| l.at(l.index.saturating_sub(start)))
    }

    /// Drains every pending label, in absolute element indices.
    pub fn take_labels(&mut self) -> Vec<Label> {
        self.labels.drain(..).collect()
    }

    /// True when a message is queued.
    pub fn has_message(&self) -> bool {
        !self.messages.is_empty()
    }

    /// Pops the next queued message.
    pub fn pop_message(&mut self) -> Option<Value> {
        let value = self.messages.pop_front();
        if value.is_some() {
            self.total_messages += 1;
        }
        value
    }

    /// Advances the buffer view by `bytes`.
    ///
    /// Labels whose range falls entirely behind the new view are staged
    /// for propagation and no longer visible. Consuming past the visible
    /// buffer is an assertion violation.
    pub fn consume(&mut self, bytes: usize) -> Result<(), Error> {
        if bytes == 0 {
            return Ok(());
        }
        let visible = self.queue.front().map(|c| c.len()).unwrap_or(0);
        if bytes > visible {
            return Err(Error::assertion(format!(
                "consumed {bytes} bytes but only {visible} visible on port {:?}",
                self.name,
            )));
        }
        if let Some(head) = self.queue.front_mut() {
            head.advance(bytes);
            if head.is_empty() {
                self.queue.pop_front();
            }
        }
        self.total_bytes += bytes as u64;
        self.consumed_this_work += bytes;

        if !self.dtype.is_empty() {
            let consumed_elements = self.total_bytes / self.dtype.size() as u64;
            while self
                .labels
                .front()
                .map_or(false, |l| l.index < consumed_elements)
            {
                if let Some(label) = self.labels.pop_front() {
                    let relative = label.index.saturating_sub(self.work_entry_elements);
                    self.consumed_labels.push(label.at(relative));
                }
            }
        }
        Ok(())
    }

    /// Requires at least `bytes` on this port before work is scheduled.
    pub fn set_reserve(&mut self, bytes: usize) {
        self.reserve_bytes = bytes;
    }

    /// The configured reserve in bytes.
    pub fn reserve(&self) -> usize {
        self.reserve_bytes
    }

    /// Total elements consumed over the port's lifetime.
    pub fn total_elements(&self) -> u64 {
        if self.dtype.is_empty() {
            0
        } else {
            self.total_bytes / self.dtype.size() as u64
        }
    }

    /// Total bytes consumed over the port's lifetime.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Total messages popped over the port's lifetime.
    pub fn total_messages(&self) -> u64 {
        self.total_messages
    }

    /// Labels of the window consumed by the current `work()`, with indices
    /// relative to the view at work entry. Read by label propagation.
    pub fn consumed_labels(&self) -> &[Label] {
        &self.consumed_labels
    }

    pub(crate) fn set_alias(&mut self, alias: Option<String>) {
        self.alias = alias;
    }

    pub(crate) fn info(&self) -> PortInfo {
        PortInfo {
            name: self.name.clone(),
            alias: self.alias.clone(),
            dtype: self.dtype.clone(),
            domain: self.domain.clone(),
            sig_slot: self.is_slot,
        }
    }

    pub(crate) fn set_upstream(&mut self, upstream: Option<(Uid, Weak<ActorCell>)>) {
        self.upstream = upstream;
    }

    pub(crate) fn upstream(&self) -> Option<&(Uid, Weak<ActorCell>)> {
        self.upstream.as_ref()
    }

    pub(crate) fn consumed_this_work(&self) -> usize {
        self.consumed_this_work
    }

    pub(crate) fn queued_bytes(&self) -> usize {
        self.queue.iter().map(|c| c.len()).sum()
    }

    pub(crate) fn begin_work(&mut self) {
        self.consumed_this_work = 0;
        self.consumed_labels.clear();
        self.work_entry_elements = self.total_elements();
    }

    /// Lands inbox contents in the port. Returns true when anything moved.
    pub(crate) fn absorb(&mut self) -> bool {
        if !self.inbox.has_any() {
            return false;
        }
        let (buffers, labels, messages) = self.inbox.drain();
        let moved = !buffers.is_empty() || !labels.is_empty() || !messages.is_empty();
        // Joining happens lazily in ensure_window, bounded by the reserve,
        // so fully consumed chunks keep draining back to their pool.
        self.queue.extend(buffers);
        self.labels.extend(labels);
        self.messages.extend(messages);
        moved
    }

    /// Grows the head view until the reserve window is satisfied.
    ///
    /// Physically adjacent chunks join without copying; a ring chunk
    /// arriving across the wrap rebases over its stamped history; when the
    /// reserve is still unmet, queued chunks are copy-combined so the
    /// reserve contract holds with any buffer manager. Growth stops at the
    /// window size so fully consumed chunks keep draining back to their
    /// pool.
    pub(crate) fn ensure_window(&mut self) {
        if self.dtype.is_empty() {
            return;
        }
        let need = self.reserve_bytes.max(self.dtype.size());
        loop {
            let head = self.buffer().len();
            if head >= need || self.queue.len() < 2 {
                break;
            }
            let second = match self.queue.remove(1) {
                Some(second) => second,
                None => break,
            };
            match self.queue[0].try_merge(second) {
                Ok(()) => {}
                Err(mut second) => {
                    let unconsumed = self.queue[0].len();
                    let same_arena = second.bytes().same_allocation(self.queue[0].bytes());
                    if same_arena && second.history() >= unconsumed {
                        // The ring replicated the unconsumed tail just
                        // ahead of this chunk; rebase over the wrap.
                        second.rebase_over(unconsumed);
                        self.queue.pop_front();
                        self.queue.push_front(second);
                    } else {
                        self.queue.insert(1, second);
                        break;
                    }
                }
            }
        }

        let head = self.buffer().len();
        if head < need && self.queued_bytes() > head {
            let mut data = Vec::with_capacity(self.queued_bytes());
            for chunk in self.queue.drain(..) {
                data.extend_from_slice(chunk.as_slice());
            }
            self.queue
                .push_back(BufferChunk::from_vec(data, self.dtype.clone()));
        }
    }

    /// Discards queued stream state (deactivation).
    pub(crate) fn clear(&mut self) {
        self.inbox.clear();
        self.queue.clear();
        self.labels.clear();
        self.messages.clear();
        self.consumed_labels.clear();
    }
}
