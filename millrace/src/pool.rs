//! Thread pools running block actors.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use serde::{Deserialize, Serialize};

use crate::actor::ActorCell;

/// How an idle pool thread waits for work.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum YieldMode {
    /// Busy-poll the queue.
    Spin,
    /// Block on the queue.
    #[default]
    Condition,
}

/// Configuration record for one thread pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThreadPoolArgs {
    /// Thread count; zero picks the machine's parallelism.
    pub size: usize,
    /// Requested CPU affinity, recorded and surfaced best-effort.
    pub affinity: Vec<usize>,
    /// Requested scheduling priority in `[-1.0, 1.0]`, recorded and
    /// surfaced best-effort.
    pub priority: f64,
    /// How idle threads wait.
    pub yield_mode: YieldMode,
}

impl Default for ThreadPoolArgs {
    fn default() -> Self {
        Self {
            size: 0,
            affinity: Vec::new(),
            priority: 0.0,
            yield_mode: YieldMode::Condition,
        }
    }
}

struct PoolInner {
    name: String,
    args: ThreadPoolArgs,
    sender: Sender<Arc<ActorCell>>,
}

/// A named pool of worker threads pulling ready actors.
///
/// Worker threads exit when the last handle drops and the injector
/// disconnects; blocks keep their pool alive through their actor cells.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    pub(crate) fn new(name: &str, args: ThreadPoolArgs) -> Self {
        let size = if args.size == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
                .max(2)
        } else {
            args.size
        };
        let (sender, receiver) = crossbeam_channel::unbounded::<Arc<ActorCell>>();
        for index in 0..size {
            let receiver = receiver.clone();
            let yield_mode = args.yield_mode;
            let builder =
                std::thread::Builder::new().name(format!("millrace-{name}-{index}"));
            let spawned = builder.spawn(move || worker_loop(receiver, yield_mode));
            if let Err(error) = spawned {
                tracing::error!(%error, pool = name, "failed to spawn pool thread");
            }
        }
        Self {
            inner: Arc::new(PoolInner {
                name: name.to_owned(),
                args,
                sender,
            }),
        }
    }

    /// The pool name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The configuration this pool was created from.
    pub fn args(&self) -> &ThreadPoolArgs {
        &self.inner.args
    }

    pub(crate) fn inject(&self, cell: Arc<ActorCell>) {
        // A send failure means the pool is tearing down; the actor stays
        // parked and is re-injected by its next stimulus.
        let _ = self.inner.sender.send(cell);
    }
}

fn worker_loop(receiver: Receiver<Arc<ActorCell>>, yield_mode: YieldMode) {
    loop {
        let cell = match yield_mode {
            YieldMode::Condition => match receiver.recv() {
                Ok(cell) => cell,
                Err(_) => return,
            },
            YieldMode::Spin => loop {
                match receiver.try_recv() {
                    Ok(cell) => break cell,
                    Err(TryRecvError::Empty) => {
                        std::hint::spin_loop();
                        std::thread::yield_now();
                    }
                    Err(TryRecvError::Disconnected) => return,
                }
            },
        };
        ActorCell::run(&cell);
    }
}
