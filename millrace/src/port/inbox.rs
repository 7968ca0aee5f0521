//! The producer-facing landing zone of an input port.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::buffer::BufferChunk;
use crate::label::Label;
use crate::object::Value;

/// How long a blocked producer waits between liveness checks of a full
/// message queue.
const FULL_QUEUE_POLL: Duration = Duration::from_millis(20);

#[derive(Default)]
struct Queues {
    buffers: VecDeque<BufferChunk>,
    labels: VecDeque<Label>,
    messages: VecDeque<Value>,
}

/// Queues filled by upstream producers and drained by the owning actor.
///
/// Buffers and labels are unbounded (stream back-pressure happens at the
/// buffer manager); the message queue is bounded and a producer posting
/// into a full queue parks until the consumer pops or goes away.
pub(crate) struct InputInbox {
    queues: Mutex<Queues>,
    space: Condvar,
    message_cap: usize,
}

impl InputInbox {
    pub(crate) fn new(message_cap: usize) -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            space: Condvar::new(),
            message_cap,
        }
    }

    pub(crate) fn push_buffer(&self, chunk: BufferChunk) {
        self.lock().buffers.push_back(chunk);
    }

    pub(crate) fn push_label(&self, label: Label) {
        self.lock().labels.push_back(label);
    }

    /// Enqueues a message, parking while the queue is full.
    ///
    /// Returns false (dropping the message) when the consumer is gone or
    /// inactive with a full queue.
    pub(crate) fn push_message(&self, value: Value, consumer_live: &dyn Fn() -> bool) -> bool {
        let mut queues = self.lock();
        while queues.messages.len() >= self.message_cap {
            if !consumer_live() {
                return false;
            }
            let (guard, _timeout) = self
                .space
                .wait_timeout(queues, FULL_QUEUE_POLL)
                .unwrap_or_else(|e| e.into_inner());
            queues = guard;
        }
        queues.messages.push_back(value);
        true
    }

    /// Takes everything queued.
    pub(crate) fn drain(&self) -> (Vec<BufferChunk>, Vec<Label>, Vec<Value>) {
        let mut queues = self.lock();
        let buffers = queues.buffers.drain(..).collect();
        let labels = queues.labels.drain(..).collect();
        let messages: Vec<Value> = queues.messages.drain(..).collect();
        drop(queues);
        if !messages.is_empty() {
            self.space.notify_all();
        }
        (buffers, labels, messages)
    }

    /// Discards everything queued (deactivation).
    pub(crate) fn clear(&self) {
        let mut queues = self.lock();
        queues.buffers.clear();
        queues.labels.clear();
        queues.messages.clear();
        drop(queues);
        self.space.notify_all();
    }

    pub(crate) fn has_any(&self) -> bool {
        let queues = self.lock();
        !queues.buffers.is_empty() || !queues.labels.is_empty() || !queues.messages.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }
}
