//! Output port state, subscribers, and delivery.

use std::sync::{Arc, Weak};

use smallvec::SmallVec;

use crate::actor::ActorCell;
use crate::buffer::{BufferChunk, BufferManager};
use crate::dtype::DType;
use crate::error::Error;
use crate::label::Label;
use crate::object::Value;
use crate::port::{InputInbox, PortInfo};
use crate::runtime::Uid;

/// One downstream input fed by an output port.
///
/// Holds the destination by uid plus a weak actor reference; the inbox is
/// the only strong edge, so dropping the consumer block ends deliveries
/// without reference cycles.
pub(crate) struct Subscriber {
    pub(crate) block: Uid,
    pub(crate) port: usize,
    pub(crate) cell: Weak<ActorCell>,
    pub(crate) inbox: Arc<InputInbox>,
}

impl Subscriber {
    fn notify(&self) {
        if let Some(cell) = self.cell.upgrade() {
            ActorCell::notify(&cell);
        }
    }

    fn live(&self) -> bool {
        self.cell.upgrade().map(|c| c.is_active()).unwrap_or(false)
    }
}

/// An output port: a buffer manager, downstream subscribers, and a staged
/// label list.
pub struct OutputPort {
    name: String,
    index: Option<usize>,
    alias: Option<String>,
    dtype: DType,
    domain: String,
    is_signal: bool,
    manager: Option<Box<dyn BufferManager>>,
    subscribers: SmallVec<[Subscriber; 2]>,
    /// Labels staged in absolute indices, flushed ahead of the next data.
    staged_labels: SmallVec<[Label; 2]>,
    total_bytes: u64,
    total_messages: u64,
    work_entry_elements: u64,
}

impl OutputPort {
    pub(crate) fn new(name: String, dtype: DType, domain: String, is_signal: bool) -> Self {
        let index = name.parse::<usize>().ok();
        Self {
            name,
            index,
            alias: None,
            dtype,
            domain,
            is_signal,
            manager: None,
            subscribers: SmallVec::new(),
            staged_labels: SmallVec::new(),
            total_bytes: 0,
            total_messages: 0,
            work_entry_elements: 0,
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

    /// The memory domain of produced buffers.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// True for signal ports.
    pub fn is_signal(&self) -> bool {
        self.is_signal
    }

    /// Total elements produced over the port's lifetime.
    pub fn total_elements(&self) -> u64 {
        if self.dtype.is_empty() {
            0
        } else {
            self.total_bytes / self.dtype.size() as u64
        }
    }

    /// Total bytes produced over the port's lifetime.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Total messages posted over the port's lifetime.
    pub fn total_messages(&self) -> u64 {
        self.total_messages
    }

    /// The writable region for the next produce.
    ///
    /// A zero-length view means the buffer pool is exhausted
    /// (back-pressure) or that no stream flow is installed on this port.
    pub fn buffer(&mut self) -> &mut [u8] {
        match self.manager.as_mut() {
            Some(manager) => manager.writable(),
            None => &mut [],
        }
    }

    /// Commits `bytes` written into [`OutputPort::buffer`]; they become
    /// visible to downstream inputs in FIFO order.
    pub fn produce(&mut self, bytes: usize) -> Result<(), Error> {
        if bytes == 0 {
            return Ok(());
        }
        self.flush_labels();
        let name = self.name.clone();
        let manager = self.manager.as_mut().ok_or_else(|| {
            Error::assertion(format!(
                "produced {bytes} bytes on port {name:?} with no buffer manager"
            ))
        })?;
        let writable = manager.writable().len();
        if bytes > writable {
            return Err(Error::assertion(format!(
                "produced {bytes} bytes but only {writable} writable on port {name:?}"
            )));
        }
        let chunk = manager.extract(bytes, &self.dtype);
        self.total_bytes += bytes as u64;
        self.deliver_chunk(chunk);
        Ok(())
    }

    /// Sends a specific chunk downstream, bypassing the port's manager.
    pub fn post_buffer(&mut self, chunk: BufferChunk) {
        self.flush_labels();
        self.total_bytes += chunk.len() as u64;
        self.deliver_chunk(chunk);
    }

    /// Stages a label whose index is relative to the next produced element.
    pub fn post_label(&mut self, label: Label) {
        let absolute = self.total_elements() + label.index;
        self.staged_labels.push(label.at(absolute));
    }

    /// Stages a label carrying an absolute stream index.
    pub(crate) fn post_label_at(&mut self, label: Label) {
        self.staged_labels.push(label);
    }

    /// Forwards a consumed-window label, anchored at this port's
    /// production count at work entry. Used by label propagation.
    pub fn forward_label(&mut self, label: Label) {
        let absolute = self.work_entry_elements + label.index;
        self.staged_labels.push(label.at(absolute));
    }

    /// Enqueues a message on every subscriber's message queue.
    ///
    /// Parks while a live subscriber's bounded queue is full; messages to
    /// dead or inactive subscribers with full queues are dropped.
    pub fn post_message(&mut self, value: Value) {
        self.flush_labels();
        self.total_messages += 1;
        for sub in &self.subscribers {
            let live = || sub.live();
            if sub.inbox.push_message(value.clone(), &live) {
                sub.notify();
            } else {
                tracing::debug!(port = %self.name, "dropped message for a gone subscriber");
            }
        }
    }

    pub(crate) fn flush_labels(&mut self) {
        for label in self.staged_labels.drain(..) {
            for sub in &self.subscribers {
                sub.inbox.push_label(label.clone());
                sub.notify();
            }
        }
    }

    fn deliver_chunk(&mut self, chunk: BufferChunk) {
        if self.subscribers.is_empty() {
            return;
        }
        for sub in &self.subscribers {
            sub.inbox.push_buffer(chunk.clone());
            sub.notify();
        }
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
            sig_slot: self.is_signal,
        }
    }

    pub(crate) fn set_manager(&mut self, manager: Box<dyn BufferManager>) {
        self.manager = Some(manager);
    }

    pub(crate) fn has_manager(&self) -> bool {
        self.manager.is_some()
    }

    pub(crate) fn writable_len(&mut self) -> usize {
        match self.manager.as_mut() {
            Some(manager) => {
                let len = manager.writable().len();
                if len == 0 {
                    manager.reclaim();
                    manager.writable().len()
                } else {
                    len
                }
            }
            None => 0,
        }
    }

    pub(crate) fn add_subscriber(&mut self, sub: Subscriber) {
        self.subscribers.push(sub);
    }

    pub(crate) fn remove_subscriber(&mut self, block: Uid, port: usize) {
        self.subscribers
            .retain(|s| !(s.block == block && s.port == port));
    }

    pub(crate) fn has_subscribers(&self) -> bool {
        !self.subscribers.is_empty()
    }

    pub(crate) fn begin_work(&mut self) {
        self.work_entry_elements = self.total_elements();
    }

    pub(crate) fn finish_work(&mut self) {
        self.flush_labels();
    }
}
