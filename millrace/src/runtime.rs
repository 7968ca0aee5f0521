//! The runtime handle: block arena, thread pools, and block factories.
//!
//! There are no process-wide singletons; everything a topology needs is
//! reached through an explicit `Runtime` handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::actor::{lock, ActorCell, ActorState, Control};
use crate::block::{Block, BlockSetup};
use crate::buffer::BufferManager;
use crate::error::Error;
use crate::object::Value;
use crate::pool::{ThreadPool, ThreadPoolArgs};
use crate::port::{InputInbox, InputPort, OutputPort, PortInfo};

/// Bound on each input port's message queue.
const MESSAGE_QUEUE_CAP: usize = 1024;

/// A process-unique identifier for blocks and topologies.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(u64);

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// A block constructor keyed by registry path.
pub type Factory = Arc<dyn Fn(&Runtime, &[Value]) -> Result<BlockHandle, Error> + Send + Sync>;

struct RuntimeInner {
    next_uid: AtomicU64,
    arena: Mutex<HashMap<Uid, Weak<ActorCell>>>,
    pools: Mutex<HashMap<String, ThreadPool>>,
    factories: Mutex<HashMap<String, Factory>>,
}

/// The shared runtime: block arena, named thread pools, and factories.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// A runtime with a default thread pool and the built-in block
    /// factories registered.
    pub fn new() -> Self {
        let runtime = Self {
            inner: Arc::new(RuntimeInner {
                next_uid: AtomicU64::new(1),
                arena: Mutex::new(HashMap::new()),
                pools: Mutex::new(HashMap::new()),
                factories: Mutex::new(HashMap::new()),
            }),
        };
        lock(&runtime.inner.pools).insert(
            "default".to_owned(),
            ThreadPool::new("default", ThreadPoolArgs::default()),
        );
        crate::codec::register_builtin_blocks(&runtime);
        runtime
    }

    pub(crate) fn next_uid(&self) -> Uid {
        Uid(self.inner.next_uid.fetch_add(1, Ordering::Relaxed))
    }

    /// The always-present default pool.
    pub fn default_pool(&self) -> ThreadPool {
        lock(&self.inner.pools)
            .get("default")
            .cloned()
            .unwrap_or_else(|| ThreadPool::new("default", ThreadPoolArgs::default()))
    }

    /// Creates a named thread pool from a configuration record.
    pub fn create_pool(&self, name: &str, args: ThreadPoolArgs) -> Result<ThreadPool, Error> {
        let mut pools = lock(&self.inner.pools);
        if pools.contains_key(name) {
            return Err(Error::runtime(format!(
                "a thread pool named {name:?} already exists"
            )));
        }
        let pool = ThreadPool::new(name, args);
        pools.insert(name.to_owned(), pool.clone());
        Ok(pool)
    }

    /// Looks up a named thread pool.
    pub fn pool(&self, name: &str) -> Option<ThreadPool> {
        lock(&self.inner.pools).get(name).cloned()
    }

    /// Registers a block factory under a registry path.
    pub fn register_factory<F>(&self, path: &str, factory: F)
    where
        F: Fn(&Runtime, &[Value]) -> Result<BlockHandle, Error> + Send + Sync + 'static,
    {
        lock(&self.inner.factories).insert(path.to_owned(), Arc::new(factory));
    }

    /// Constructs a block through its registered factory.
    pub fn make(&self, path: &str, args: &[Value]) -> Result<BlockHandle, Error> {
        let factory = lock(&self.inner.factories)
            .get(path)
            .cloned()
            .ok_or_else(|| Error::runtime(format!("no block factory registered at {path:?}")))?;
        factory(self, args)
    }

    /// Registers a user block, pairing it with a fresh actor.
    pub fn register<B: Block>(&self, block: B) -> Result<BlockHandle, Error> {
        let mut user: Box<dyn Block> = Box::new(block);
        let mut setup = BlockSetup::new();
        user.setup(&mut setup);

        for ports in [&setup.inputs, &setup.outputs] {
            let mut names = std::collections::HashSet::new();
            for def in ports.iter() {
                if !names.insert(def.name.clone()) {
                    return Err(Error::runtime(format!(
                        "duplicate port name {:?} on block {:?}",
                        def.name, setup.name
                    )));
                }
            }
        }

        let uid = self.next_uid();
        let name = if setup.name.is_empty() {
            format!("Block{uid}")
        } else {
            setup.name.clone()
        };

        let mut inputs = Vec::with_capacity(setup.inputs.len());
        let mut inboxes = Vec::with_capacity(setup.inputs.len());
        for def in setup.inputs.drain(..) {
            let inbox = Arc::new(InputInbox::new(MESSAGE_QUEUE_CAP));
            inboxes.push(Arc::clone(&inbox));
            inputs.push(InputPort::new(
                def.name, def.dtype, def.domain, def.sig_slot, inbox,
            ));
        }
        let mut outputs = Vec::with_capacity(setup.outputs.len());
        for def in setup.outputs.drain(..) {
            outputs.push(OutputPort::new(def.name, def.dtype, def.domain, def.sig_slot));
        }

        let meta = BlockMeta {
            inputs: inputs.iter().map(|p| p.info()).collect(),
            outputs: outputs.iter().map(|p| p.info()).collect(),
        };
        let state = ActorState::new(
            user,
            inputs,
            outputs,
            setup.calls,
            setup.named_handlers,
            setup.probes,
        );
        let cell = ActorCell::new(uid, name, self.default_pool(), state, inboxes);
        lock(&self.inner.arena).insert(uid, Arc::downgrade(&cell));
        Ok(BlockHandle {
            uid,
            cell,
            meta: Arc::new(Mutex::new(meta)),
        })
    }

    /// Looks a live block up by uid.
    pub(crate) fn block(&self, uid: Uid) -> Option<Arc<ActorCell>> {
        let mut arena = lock(&self.inner.arena);
        match arena.get(&uid).and_then(Weak::upgrade) {
            Some(cell) => Some(cell),
            None => {
                arena.remove(&uid);
                None
            }
        }
    }

    /// The work stats of a live block, by uid.
    pub fn block_stats(&self, uid: Uid) -> Option<serde_json::Value> {
        let cell = self.block(uid)?;
        let (reply, response) = crossbeam_channel::bounded(1);
        ActorCell::send(&cell, Control::QueryStats { reply });
        response.recv().ok()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct BlockMeta {
    pub(crate) inputs: Vec<PortInfo>,
    pub(crate) outputs: Vec<PortInfo>,
}

/// A shared handle to a registered block.
#[derive(Clone)]
pub struct BlockHandle {
    uid: Uid,
    cell: Arc<ActorCell>,
    meta: Arc<Mutex<BlockMeta>>,
}

impl BlockHandle {
    /// The block's process-unique identifier.
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// The block's display name.
    pub fn name(&self) -> String {
        self.cell.name()
    }

    /// Sets the block's display name.
    pub fn set_name(&self, name: &str) {
        self.cell.set_name(name);
    }

    /// True while the block is active in a committed topology.
    pub fn is_active(&self) -> bool {
        self.cell.is_active()
    }

    /// The block's activity indicator.
    pub fn activity(&self) -> usize {
        self.cell.activity()
    }

    /// Invokes a registered call by name.
    ///
    /// The call is marshaled through the block's actor and runs between
    /// `work()` invocations.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, Error> {
        let (reply, response) = crossbeam_channel::bounded(1);
        ActorCell::send(
            &self.cell,
            Control::Call {
                name: name.to_owned(),
                args: args.to_vec(),
                reply,
            },
        );
        response
            .recv()
            .map_err(|_| Error::runtime("block actor terminated"))?
    }

    /// Assigns the block to a thread pool.
    pub fn set_thread_pool(&self, pool: &ThreadPool) {
        ActorCell::send(&self.cell, Control::SetThreadPool(pool.clone()));
    }

    /// Sets a display alias for an input port.
    pub fn set_input_alias(&self, port: &str, alias: &str) -> Result<(), Error> {
        let index = self
            .input_index(port)
            .ok_or_else(|| Error::no_port(self.name(), port))?;
        let mut meta = lock(&self.meta);
        meta.inputs[index].alias = Some(alias.to_owned());
        drop(meta);
        ActorCell::send(
            &self.cell,
            Control::SetInputAlias {
                port: index,
                alias: alias.to_owned(),
            },
        );
        Ok(())
    }

    /// Sets a display alias for an output port.
    pub fn set_output_alias(&self, port: &str, alias: &str) -> Result<(), Error> {
        let index = self
            .output_index(port)
            .ok_or_else(|| Error::no_port(self.name(), port))?;
        let mut meta = lock(&self.meta);
        meta.outputs[index].alias = Some(alias.to_owned());
        drop(meta);
        ActorCell::send(
            &self.cell,
            Control::SetOutputAlias {
                port: index,
                alias: alias.to_owned(),
            },
        );
        Ok(())
    }

    /// Information about the block's input ports.
    pub fn input_port_info(&self) -> Vec<PortInfo> {
        lock(&self.meta).inputs.clone()
    }

    /// Information about the block's output ports.
    pub fn output_port_info(&self) -> Vec<PortInfo> {
        lock(&self.meta).outputs.clone()
    }

    /// The block's work stats as JSON.
    pub fn stats(&self) -> serde_json::Value {
        let (reply, response) = crossbeam_channel::bounded(1);
        ActorCell::send(&self.cell, Control::QueryStats { reply });
        response.recv().unwrap_or(serde_json::Value::Null)
    }

    pub(crate) fn cell(&self) -> &Arc<ActorCell> {
        &self.cell
    }

    pub(crate) fn input_index(&self, name: &str) -> Option<usize> {
        lock(&self.meta).inputs.iter().position(|p| p.name == name)
    }

    pub(crate) fn output_index(&self, name: &str) -> Option<usize> {
        lock(&self.meta).outputs.iter().position(|p| p.name == name)
    }

    pub(crate) fn input_info(&self, index: usize) -> Option<PortInfo> {
        lock(&self.meta).inputs.get(index).cloned()
    }

    pub(crate) fn output_info(&self, index: usize) -> Option<PortInfo> {
        lock(&self.meta).outputs.get(index).cloned()
    }

    pub(crate) fn negotiate_input(
        &self,
        port: usize,
        peer_domain: &str,
    ) -> Result<Option<Box<dyn BufferManager>>, Error> {
        let (reply, response) = crossbeam_channel::bounded(1);
        ActorCell::send(
            &self.cell,
            Control::NegotiateInput {
                port,
                peer_domain: peer_domain.to_owned(),
                reply,
            },
        );
        response
            .recv()
            .map_err(|_| Error::runtime("block actor terminated"))?
    }

    pub(crate) fn negotiate_output(
        &self,
        port: usize,
        peer_domain: &str,
    ) -> Result<Option<Box<dyn BufferManager>>, Error> {
        let (reply, response) = crossbeam_channel::bounded(1);
        ActorCell::send(
            &self.cell,
            Control::NegotiateOutput {
                port,
                peer_domain: peer_domain.to_owned(),
                reply,
            },
        );
        response
            .recv()
            .map_err(|_| Error::runtime("block actor terminated"))?
    }

    pub(crate) fn control_sync(&self, make: impl FnOnce(crossbeam_channel::Sender<()>) -> Control) {
        let (reply, response) = crossbeam_channel::bounded(1);
        ActorCell::send(&self.cell, make(reply));
        let _ = response.recv();
    }
}

impl std::fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockHandle")
            .field("uid", &self.uid.to_string())
            .field("name", &self.name())
            .finish()
    }
}
