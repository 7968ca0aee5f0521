//! The per-block worker actor.
//!
//! Every block runs inside exactly one actor: a control mailbox, per-input
//! inboxes filled by upstream producers, and a run procedure that converts
//! heterogeneous stimuli into `work()` invocations. `work()` is never
//! called concurrently with itself; calls arriving from other threads are
//! marshaled through the mailbox and execute between invocations.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::Sender;
use serde_json::json;

use crate::block::{Block, WorkInfo, WorkIo};
use crate::buffer::BufferManager;
use crate::error::Error;
use crate::object::{CallTable, OpaqueFn, Value};
use crate::pool::ThreadPool;
use crate::port::{InputInbox, InputPort, OutputPort, Subscriber};
use crate::runtime::Uid;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Control messages marshaled through an actor's mailbox.
pub(crate) enum Control {
    Call {
        name: String,
        args: Vec<Value>,
        reply: Sender<Result<Value, Error>>,
    },
    NegotiateInput {
        port: usize,
        peer_domain: String,
        reply: Sender<Result<Option<Box<dyn BufferManager>>, Error>>,
    },
    NegotiateOutput {
        port: usize,
        peer_domain: String,
        reply: Sender<Result<Option<Box<dyn BufferManager>>, Error>>,
    },
    InstallManager {
        port: usize,
        manager: Box<dyn BufferManager>,
        reply: Sender<()>,
    },
    Subscribe {
        port: usize,
        subscriber: Subscriber,
        reply: Sender<()>,
    },
    Unsubscribe {
        port: usize,
        block: Uid,
        dst_port: usize,
        reply: Sender<()>,
    },
    SetUpstream {
        port: usize,
        upstream: Option<(Uid, Weak<ActorCell>)>,
        reply: Sender<()>,
    },
    Activate {
        reply: Sender<()>,
    },
    Deactivate {
        reply: Sender<()>,
    },
    SetThreadPool(ThreadPool),
    SetInputAlias {
        port: usize,
        alias: String,
    },
    SetOutputAlias {
        port: usize,
        alias: String,
    },
    QueryStats {
        reply: Sender<serde_json::Value>,
    },
}

/// The shared cell of one block's actor.
pub(crate) struct ActorCell {
    uid: Uid,
    name: Mutex<String>,
    mailbox: Mutex<VecDeque<Control>>,
    scheduled: AtomicBool,
    active: AtomicBool,
    activity: AtomicUsize,
    pool: Mutex<ThreadPool>,
    state: Mutex<ActorState>,
    /// Landing zones for upstream producers, one per input port.
    pub(crate) inboxes: Vec<Arc<InputInbox>>,
}

impl ActorCell {
    pub(crate) fn new(
        uid: Uid,
        name: String,
        pool: ThreadPool,
        state: ActorState,
        inboxes: Vec<Arc<InputInbox>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            uid,
            name: Mutex::new(name),
            mailbox: Mutex::new(VecDeque::new()),
            scheduled: AtomicBool::new(false),
            active: AtomicBool::new(false),
            activity: AtomicUsize::new(0),
            pool: Mutex::new(pool),
            state: Mutex::new(state),
            inboxes,
        })
    }

    pub(crate) fn uid(&self) -> Uid {
        self.uid
    }

    pub(crate) fn name(&self) -> String {
        lock(&self.name).clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        *lock(&self.name) = name.to_owned();
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// The monotonically increasing activity indicator.
    pub(crate) fn activity(&self) -> usize {
        self.activity.load(Ordering::Acquire)
    }

    /// Schedules the actor on its pool, once, until it next runs.
    pub(crate) fn notify(cell: &Arc<ActorCell>) {
        if !cell.scheduled.swap(true, Ordering::AcqRel) {
            let pool = lock(&cell.pool).clone();
            pool.inject(Arc::clone(cell));
        }
    }

    /// Enqueues a control message and schedules the actor.
    pub(crate) fn send(cell: &Arc<ActorCell>, control: Control) {
        lock(&cell.mailbox).push_back(control);
        Self::notify(cell);
    }

    /// One scheduling turn: controls, inbox drain, slots, and `work()`.
    pub(crate) fn run(cell: &Arc<ActorCell>) {
        cell.scheduled.store(false, Ordering::Release);
        let mut state = lock(&cell.state);

        let mut events = 0usize;
        loop {
            let control = lock(&cell.mailbox).pop_front();
            match control {
                Some(control) => {
                    events += 1;
                    state.handle_control(cell, control);
                }
                None => break,
            }
        }

        let mut moved = false;
        let mut rerun = false;
        if cell.active.load(Ordering::Acquire) {
            for input in state.inputs.iter_mut() {
                moved |= input.absorb();
            }
            moved |= state.dispatch_slots(cell);
            if state.failure.is_none() && state.user.prepare() && state.ready() {
                let (progress, yielded) = state.run_work();
                moved |= progress;
                rerun = progress || yielded;
            }
        }

        if events > 0 || moved {
            cell.activity.fetch_add(1, Ordering::Release);
        }
        drop(state);
        if rerun {
            Self::notify(cell);
        }
    }
}

/// The actor-owned half of a block: ports, call table, and the user
/// implementation.
pub(crate) struct ActorState {
    user: Box<dyn Block>,
    inputs: Vec<InputPort>,
    outputs: Vec<OutputPort>,
    calls: CallTable,
    named_handlers: HashMap<String, OpaqueFn>,
    probes: HashMap<String, (String, String)>,
    failure: Option<Error>,
    last_work_ms: Option<u64>,
}

impl ActorState {
    pub(crate) fn new(
        user: Box<dyn Block>,
        inputs: Vec<InputPort>,
        outputs: Vec<OutputPort>,
        calls: CallTable,
        named_handlers: HashMap<String, OpaqueFn>,
        probes: HashMap<String, (String, String)>,
    ) -> Self {
        Self {
            user,
            inputs,
            outputs,
            calls,
            named_handlers,
            probes,
            failure: None,
            last_work_ms: None,
        }
    }

    fn handle_control(&mut self, cell: &Arc<ActorCell>, control: Control) {
        match control {
            Control::Call { name, args, reply } => {
                let result = self.dispatch_call(cell, &name, &args);
                let _ = reply.send(result);
            }
            Control::NegotiateInput {
                port,
                peer_domain,
                reply,
            } => {
                let name = self
                    .inputs
                    .get(port)
                    .map(|p| p.name().to_owned())
                    .unwrap_or_default();
                let result = self.user.input_buffer_manager(&name, &peer_domain);
                let _ = reply.send(result);
            }
            Control::NegotiateOutput {
                port,
                peer_domain,
                reply,
            } => {
                let name = self
                    .outputs
                    .get(port)
                    .map(|p| p.name().to_owned())
                    .unwrap_or_default();
                let result = self.user.output_buffer_manager(&name, &peer_domain);
                let _ = reply.send(result);
            }
            Control::InstallManager {
                port,
                manager,
                reply,
            } => {
                if let Some(output) = self.outputs.get_mut(port) {
                    output.set_manager(manager);
                }
                let _ = reply.send(());
            }
            Control::Subscribe {
                port,
                subscriber,
                reply,
            } => {
                if let Some(output) = self.outputs.get_mut(port) {
                    output.add_subscriber(subscriber);
                }
                let _ = reply.send(());
            }
            Control::Unsubscribe {
                port,
                block,
                dst_port,
                reply,
            } => {
                if let Some(output) = self.outputs.get_mut(port) {
                    output.remove_subscriber(block, dst_port);
                }
                let _ = reply.send(());
            }
            Control::SetUpstream {
                port,
                upstream,
                reply,
            } => {
                if let Some(input) = self.inputs.get_mut(port) {
                    input.set_upstream(upstream);
                }
                let _ = reply.send(());
            }
            Control::Activate { reply } => {
                if !cell.active.load(Ordering::Acquire) {
                    if let Err(error) = self.user.activate() {
                        tracing::error!(%error, block = %cell.name(), "activate hook failed");
                        self.failure = Some(error);
                    }
                    cell.active.store(true, Ordering::Release);
                }
                let _ = reply.send(());
            }
            Control::Deactivate { reply } => {
                if cell.active.swap(false, Ordering::AcqRel) {
                    // Queued stream events are discarded; in-flight work
                    // already completed because this turn holds the state.
                    for input in self.inputs.iter_mut() {
                        input.clear();
                    }
                    if let Err(error) = self.user.deactivate() {
                        tracing::error!(%error, block = %cell.name(), "deactivate hook failed");
                    }
                }
                let _ = reply.send(());
            }
            Control::SetThreadPool(pool) => {
                *lock(&cell.pool) = pool;
            }
            Control::SetInputAlias { port, alias } => {
                if let Some(input) = self.inputs.get_mut(port) {
                    input.set_alias(Some(alias));
                }
            }
            Control::SetOutputAlias { port, alias } => {
                if let Some(output) = self.outputs.get_mut(port) {
                    output.set_alias(Some(alias));
                }
            }
            Control::QueryStats { reply } => {
                let _ = reply.send(self.stats(cell));
            }
        }
    }

    /// Opaque call dispatch: typed overloads, then probes, then the named
    /// opaque handler, then the block's wildcard handler.
    fn dispatch_call(
        &mut self,
        cell: &Arc<ActorCell>,
        name: &str,
        args: &[Value],
    ) -> Result<Value, Error> {
        let block_name = cell.name();

        if self.calls.contains(name) {
            let ActorState { user, calls, .. } = self;
            match calls.dispatch(&block_name, user.as_any(), name, args) {
                Err(Error::BlockCallNotFound { .. }) => {}
                other => return other,
            }
        }

        if let Some((call, signal)) = self.probes.get(name).cloned() {
            let result = self.dispatch_call(cell, &call, args)?;
            let signal_args = if result.is_unit() {
                Vec::new()
            } else {
                vec![result]
            };
            if let Some(port) = self
                .outputs
                .iter_mut()
                .find(|p| p.is_signal() && p.name() == signal)
            {
                port.post_message(Value::List(signal_args));
            }
            return Ok(Value::Unit);
        }

        {
            let ActorState {
                user,
                named_handlers,
                ..
            } = self;
            if let Some(handler) = named_handlers.get_mut(name) {
                return handler(user.as_any(), args);
            }
        }

        match self.user.opaque_call(name, args) {
            Err(Error::BlockCallNotFound { call, .. }) => Err(Error::no_call(block_name, call)),
            other => other,
        }
    }

    /// Pops slot messages and dispatches them as calls.
    fn dispatch_slots(&mut self, cell: &Arc<ActorCell>) -> bool {
        let mut did = false;
        for index in 0..self.inputs.len() {
            if !self.inputs[index].is_slot() {
                continue;
            }
            while let Some(message) = self.inputs[index].pop_message() {
                did = true;
                let slot = self.inputs[index].name().to_owned();
                let args = match message {
                    Value::List(values) => values,
                    other => vec![other],
                };
                if let Err(error) = self.dispatch_call(cell, &slot, &args) {
                    tracing::error!(%error, slot = %slot, "slot dispatch failed");
                }
            }
        }
        did
    }

    /// The activation decision: reserves honored, pending messages
    /// override stream availability, and every connected stream output
    /// needs a byte of write space.
    fn ready(&mut self) -> bool {
        let has_message = self.inputs.iter().any(|i| i.has_message());

        let mut any_stream_input = false;
        let mut stream_ready = true;
        for input in self.inputs.iter_mut() {
            if input.dtype().is_empty() {
                continue;
            }
            any_stream_input = true;
            input.ensure_window();
            let need = input.reserve().max(input.dtype().size());
            if input.buffer().len() < need {
                stream_ready = false;
            }
        }
        if any_stream_input && !stream_ready && !has_message {
            return false;
        }

        for output in self.outputs.iter_mut() {
            if output.dtype().is_empty() || !output.has_manager() || !output.has_subscribers() {
                continue;
            }
            if output.writable_len() == 0 {
                return false;
            }
        }
        true
    }

    /// Runs `work()` once and settles accounting. Returns
    /// `(made_progress, requested_reschedule)`.
    fn run_work(&mut self) -> (bool, bool) {
        let bytes_before: u64 = self.inputs.iter().map(|i| i.total_bytes()).sum::<u64>()
            + self.outputs.iter().map(|o| o.total_bytes()).sum::<u64>();
        let messages_before: u64 = self.inputs.iter().map(|i| i.total_messages()).sum::<u64>()
            + self
                .outputs
                .iter()
                .map(|o| o.total_messages())
                .sum::<u64>();

        for input in self.inputs.iter_mut() {
            input.begin_work();
        }
        for output in self.outputs.iter_mut() {
            output.begin_work();
        }
        let info = self.work_info();

        let yielded;
        let result;
        {
            let ActorState {
                user,
                inputs,
                outputs,
                ..
            } = self;
            let mut io = WorkIo {
                inputs,
                outputs,
                info,
                reschedule: false,
            };
            result = user.work(&mut io);
            yielded = io.reschedule;
        }
        if let Err(error) = result {
            tracing::error!(%error, "work failed; block marked failed");
            self.failure = Some(error);
        }

        for index in 0..self.inputs.len() {
            if self.inputs[index].consumed_labels().is_empty() {
                continue;
            }
            let ActorState {
                user,
                inputs,
                outputs,
                ..
            } = self;
            user.propagate_labels(&inputs[index], outputs);
        }
        for output in self.outputs.iter_mut() {
            output.finish_work();
        }

        // Freed input bytes may unblock an exhausted upstream pool.
        for input in self.inputs.iter() {
            if input.consumed_this_work() > 0 {
                if let Some((_, upstream)) = input.upstream() {
                    if let Some(cell) = upstream.upgrade() {
                        ActorCell::notify(&cell);
                    }
                }
            }
        }

        self.last_work_ms = Some(epoch_millis());

        let bytes_after: u64 = self.inputs.iter().map(|i| i.total_bytes()).sum::<u64>()
            + self.outputs.iter().map(|o| o.total_bytes()).sum::<u64>();
        let messages_after: u64 = self.inputs.iter().map(|i| i.total_messages()).sum::<u64>()
            + self
                .outputs
                .iter()
                .map(|o| o.total_messages())
                .sum::<u64>();
        let progress = bytes_after != bytes_before || messages_after != messages_before;
        (progress, yielded)
    }

    fn work_info(&mut self) -> WorkInfo {
        let mut min_in = usize::MAX;
        for input in self.inputs.iter() {
            if !input.dtype().is_empty() {
                min_in = min_in.min(input.elements());
            }
        }
        let mut min_out = usize::MAX;
        for output in self.outputs.iter_mut() {
            if !output.dtype().is_empty() && output.has_manager() {
                let size = output.dtype().size();
                min_out = min_out.min(output.writable_len() / size);
            }
        }
        let min_in = if min_in == usize::MAX { 0 } else { min_in };
        let min_out = if min_out == usize::MAX { 0 } else { min_out };
        WorkInfo {
            min_elements: min_in.min(min_out),
            min_in_elements: min_in,
            min_out_elements: min_out,
        }
    }

    fn stats(&self, cell: &Arc<ActorCell>) -> serde_json::Value {
        let inputs: Vec<serde_json::Value> = self
            .inputs
            .iter()
            .map(|p| {
                json!({
                    "name": p.name(),
                    "totalElements": p.total_elements(),
                    "totalBytes": p.total_bytes(),
                    "totalMessages": p.total_messages(),
                    "queuedBytes": p.queued_bytes() as u64,
                    "reserveBytes": p.reserve() as u64,
                })
            })
            .collect();
        let outputs: Vec<serde_json::Value> = self
            .outputs
            .iter()
            .map(|p| {
                json!({
                    "name": p.name(),
                    "totalElements": p.total_elements(),
                    "totalBytes": p.total_bytes(),
                    "totalMessages": p.total_messages(),
                })
            })
            .collect();
        json!({
            "name": cell.name(),
            "uid": cell.uid().to_string(),
            "active": cell.is_active(),
            "activityIndicator": cell.activity() as u64,
            "lastWorkTime": self.last_work_ms,
            "failure": self.failure.as_ref().map(|e| e.to_string()),
            "inputs": inputs,
            "outputs": outputs,
        })
    }
}
