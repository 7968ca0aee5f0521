//! Topologies: user-declared graphs of blocks, possibly hierarchical,
//! compiled at commit into flat flows over real block ports.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use itertools::Itertools;

use crate::actor::lock;
use crate::error::Error;
use crate::object::Value;
use crate::pool::ThreadPool;
use crate::runtime::{BlockHandle, Runtime, Uid};

mod commit;
mod flatten;
mod json;

pub use json::DumpMode;

pub(crate) use flatten::{flatten, real_blocks_with_heritage};

/// One endpoint of a user-declared flow.
#[derive(Clone)]
pub(crate) enum EndpointKind {
    /// A real block port.
    Block(BlockHandle),
    /// A port on a nested sub-topology's surface.
    Topology(Topology),
    /// A port on the surface of the declaring topology itself.
    Own,
}

#[derive(Clone)]
pub(crate) struct Endpoint {
    pub(crate) kind: EndpointKind,
    pub(crate) port: String,
}

impl Endpoint {
    pub(crate) fn uid(&self, own: Uid) -> Uid {
        match &self.kind {
            EndpointKind::Block(handle) => handle.uid(),
            EndpointKind::Topology(topology) => topology.uid(),
            EndpointKind::Own => own,
        }
    }
}

/// A user-declared edge between two ports.
#[derive(Clone)]
pub(crate) struct Flow {
    pub(crate) src: Endpoint,
    pub(crate) dst: Endpoint,
}

impl Flow {
    fn same(&self, other: &Flow, own: Uid) -> bool {
        self.src.uid(own) == other.src.uid(own)
            && self.src.port == other.src.port
            && self.dst.uid(own) == other.dst.uid(own)
            && self.dst.port == other.dst.port
    }
}

/// A flow whose endpoints are real block ports.
#[derive(Clone)]
pub(crate) struct FlatFlow {
    pub(crate) src: (BlockHandle, String),
    pub(crate) dst: (BlockHandle, String),
}

impl FlatFlow {
    pub(crate) fn key(&self) -> (Uid, String, Uid, String) {
        (
            self.src.0.uid(),
            self.src.1.clone(),
            self.dst.0.uid(),
            self.dst.1.clone(),
        )
    }
}

pub(crate) struct TopologyInner {
    pub(crate) runtime: Runtime,
    pub(crate) uid: Uid,
    pub(crate) name: String,
    pub(crate) flows: Vec<Flow>,
    pub(crate) active_flat: Vec<FlatFlow>,
    pub(crate) committed: HashMap<Uid, BlockHandle>,
    pub(crate) calls: HashMap<String, (BlockHandle, String)>,
    pub(crate) input_names: Vec<String>,
    pub(crate) output_names: Vec<String>,
    pub(crate) pool: Option<ThreadPool>,
}

impl Drop for TopologyInner {
    fn drop(&mut self) {
        // Destruction implicitly disconnects all and commits; failures are
        // logged, never raised.
        self.flows.clear();
        if let Err(error) = commit::commit_inner(self) {
            tracing::error!(%error, topology = %self.name, "topology teardown failed");
        }
    }
}

/// An endpoint argument accepted by [`Topology::connect`].
#[derive(Clone)]
pub enum Connector {
    /// A block endpoint.
    Block(BlockHandle),
    /// A (sub-)topology endpoint.
    Topology(Topology),
}

impl Connector {
    fn uid(&self) -> Uid {
        match self {
            Connector::Block(handle) => handle.uid(),
            Connector::Topology(topology) => topology.uid(),
        }
    }
}

impl From<&BlockHandle> for Connector {
    fn from(handle: &BlockHandle) -> Self {
        Connector::Block(handle.clone())
    }
}

impl From<BlockHandle> for Connector {
    fn from(handle: BlockHandle) -> Self {
        Connector::Block(handle)
    }
}

impl From<&Topology> for Connector {
    fn from(topology: &Topology) -> Self {
        Connector::Topology(topology.clone())
    }
}

impl From<Topology> for Connector {
    fn from(topology: Topology) -> Self {
        Connector::Topology(topology)
    }
}

/// A container of blocks and flows, itself connectable inside another
/// topology. Cheap to clone; all clones address one topology.
#[derive(Clone)]
pub struct Topology {
    uid: Uid,
    inner: Arc<Mutex<TopologyInner>>,
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology").field("uid", &self.uid).finish()
    }
}

impl Topology {
    /// An empty topology in the given runtime.
    pub fn new(runtime: &Runtime) -> Self {
        let uid = runtime.next_uid();
        Self {
            uid,
            inner: Arc::new(Mutex::new(TopologyInner {
                runtime: runtime.clone(),
                uid,
                name: "Topology".to_owned(),
                flows: Vec::new(),
                active_flat: Vec::new(),
                committed: HashMap::new(),
                calls: HashMap::new(),
                input_names: Vec::new(),
                output_names: Vec::new(),
                pool: None,
            })),
        }
    }

    /// The topology's process-unique identifier.
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// The display name.
    pub fn name(&self) -> String {
        self.lock_inner().name.clone()
    }

    /// The runtime this topology lives in.
    pub fn runtime(&self) -> Runtime {
        self.lock_inner().runtime.clone()
    }

    /// Sets the display name.
    pub fn set_name(&self, name: &str) {
        self.lock_inner().name = name.to_owned();
    }

    /// Assigns a thread pool applied to blocks at commit.
    pub fn set_thread_pool(&self, pool: &ThreadPool) {
        self.lock_inner().pool = Some(pool.clone());
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, TopologyInner> {
        lock(&self.inner)
    }

    /// Declares a flow from a source port to a destination port.
    ///
    /// Either endpoint may be a block, a nested topology, or this topology
    /// itself (declaring a surface port). Port existence on real blocks is
    /// validated immediately; duplicate flows are rejected.
    pub fn connect(
        &self,
        src: impl Into<Connector>,
        src_port: impl ToString,
        dst: impl Into<Connector>,
        dst_port: impl ToString,
    ) -> Result<(), Error> {
        let flow = self.make_flow(src.into(), src_port.to_string(), dst.into(), dst_port.to_string())?;
        let mut inner = self.lock_inner();

        if inner.flows.iter().any(|f| f.same(&flow, self.uid)) {
            return Err(Error::connect(format!(
                "this flow already exists in the topology ({} -> {})",
                flow.src.port, flow.dst.port
            )));
        }

        let src_own = matches!(flow.src.kind, EndpointKind::Own);
        let dst_own = matches!(flow.dst.kind, EndpointKind::Own);
        if src_own {
            inner.input_names.push(flow.src.port.clone());
        }
        if dst_own {
            inner.output_names.push(flow.dst.port.clone());
        }

        inner.flows.push(flow);
        Ok(())
    }

    /// Removes a previously declared flow.
    pub fn disconnect(
        &self,
        src: impl Into<Connector>,
        src_port: impl ToString,
        dst: impl Into<Connector>,
        dst_port: impl ToString,
    ) -> Result<(), Error> {
        let flow = self.make_flow(src.into(), src_port.to_string(), dst.into(), dst_port.to_string())?;
        let mut inner = self.lock_inner();
        let position = inner
            .flows
            .iter()
            .position(|f| f.same(&flow, self.uid))
            .ok_or_else(|| {
                Error::connect(format!(
                    "this flow does not exist in the topology ({} -> {})",
                    flow.src.port, flow.dst.port
                ))
            })?;
        let removed = inner.flows.remove(position);

        if matches!(removed.src.kind, EndpointKind::Own) {
            if let Some(i) = inner.input_names.iter().position(|n| *n == removed.src.port) {
                inner.input_names.remove(i);
            }
        }
        if matches!(removed.dst.kind, EndpointKind::Own) {
            if let Some(i) = inner
                .output_names
                .iter()
                .position(|n| *n == removed.dst.port)
            {
                inner.output_names.remove(i);
            }
        }
        Ok(())
    }

    /// Removes every declared flow. Takes effect at the next commit.
    pub fn disconnect_all(&self) {
        let mut inner = self.lock_inner();
        inner.flows.clear();
        inner.input_names.clear();
        inner.output_names.clear();
    }

    /// Computes the flat flow set and applies the difference from the last
    /// commit: buffer negotiation and subscription for added flows,
    /// unsubscription for removed ones, and block activation transitions.
    ///
    /// Transactional: on error nothing has changed and the error is
    /// surfaced synchronously.
    pub fn commit(&self) -> Result<(), Error> {
        let mut inner = self.lock_inner();
        commit::commit_inner(&mut inner)
    }

    /// Polls every active block's activity indicator until all have been
    /// idle for `idle` simultaneously, or `timeout` expires.
    ///
    /// A zero `timeout` waits forever. Returns true when quiescence was
    /// observed.
    pub fn wait_inactive(&self, idle: Duration, timeout: Duration) -> bool {
        let blocks: Vec<BlockHandle> = {
            let inner = self.lock_inner();
            inner
                .active_flat
                .iter()
                .flat_map(|f| [f.src.0.clone(), f.dst.0.clone()])
                .unique_by(|b| b.uid())
                .collect()
        };

        let poll = (idle / 3).max(Duration::from_millis(1));
        let entry = Instant::now();
        let mut last_time = vec![entry; blocks.len()];
        let mut last_indicator = vec![0usize; blocks.len()];

        loop {
            let mut all_idle = true;
            let now = Instant::now();
            for (index, block) in blocks.iter().enumerate() {
                let indicator = block.activity();
                if last_indicator[index] != indicator {
                    last_time[index] = now;
                    last_indicator[index] = indicator;
                }
                if now.duration_since(last_time[index].max(entry)) < idle {
                    all_idle = false;
                }
            }
            if all_idle {
                return true;
            }
            std::thread::sleep(poll);
            if !timeout.is_zero() && Instant::now() >= entry + timeout {
                return false;
            }
        }
    }

    /// Registers a call on this topology forwarded to a block inside it.
    pub fn register_call(&self, name: &str, block: &BlockHandle, target: &str) {
        self.lock_inner()
            .calls
            .insert(name.to_owned(), (block.clone(), target.to_owned()));
    }

    /// Invokes a registered (forwarded) call.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, Error> {
        let target = {
            let inner = self.lock_inner();
            inner.calls.get(name).cloned()
        };
        match target {
            Some((block, target)) => block.call(&target, args),
            None => Err(Error::no_call(self.name(), name)),
        }
    }

    /// Names of the topology's declared input surface ports, in first
    /// appearance order.
    pub fn input_port_names(&self) -> Vec<String> {
        self.lock_inner()
            .input_names
            .iter()
            .unique()
            .cloned()
            .collect()
    }

    /// Names of the topology's declared output surface ports, in first
    /// appearance order.
    pub fn output_port_names(&self) -> Vec<String> {
        self.lock_inner()
            .output_names
            .iter()
            .unique()
            .cloned()
            .collect()
    }

    fn make_flow(
        &self,
        src: Connector,
        src_port: String,
        dst: Connector,
        dst_port: String,
    ) -> Result<Flow, Error> {
        // Real block ports must exist before connection.
        if let Connector::Block(handle) = &src {
            if handle.output_index(&src_port).is_none() {
                return Err(Error::connect(format!(
                    "block {} has no output port named {src_port:?}",
                    handle.name()
                )));
            }
        }
        if let Connector::Block(handle) = &dst {
            if handle.input_index(&dst_port).is_none() {
                return Err(Error::connect(format!(
                    "block {} has no input port named {dst_port:?}",
                    handle.name()
                )));
            }
        }
        let src_kind = if src.uid() == self.uid {
            EndpointKind::Own
        } else {
            match src {
                Connector::Block(handle) => EndpointKind::Block(handle),
                Connector::Topology(topology) => EndpointKind::Topology(topology),
            }
        };
        let dst_kind = if dst.uid() == self.uid {
            EndpointKind::Own
        } else {
            match dst {
                Connector::Block(handle) => EndpointKind::Block(handle),
                Connector::Topology(topology) => EndpointKind::Topology(topology),
            }
        };
        Ok(Flow {
            src: Endpoint {
                kind: src_kind,
                port: src_port,
            },
            dst: Endpoint {
                kind: dst_kind,
                port: dst_port,
            },
        })
    }
}
