//! Per-connection bus executor.
//!
//! Every operation that touches one client's Modbus transport — poll
//! ticks, reconfiguration, write commands, completion handling — is
//! submitted here and runs on a single worker task, one job at a time,
//! in submission order. Callers never block: `submit` enqueues and
//! returns.
//!
//! Periodic loops are driven by a ticker task per loop that enqueues one
//! job per tick. A loop handle is a generation token in a liveness set;
//! `stop_loop` removes it, and the check is repeated on the worker right
//! before a tick runs, so a stale tick from a replaced loop can never
//! run after its successor has started.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Token identifying one registered periodic loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopHandle(u64);

/// Handle to a client's serialized execution context.
#[derive(Clone)]
pub struct BusExecutor {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    tx: mpsc::UnboundedSender<Job>,
    live_loops: Mutex<HashSet<u64>>,
    next_handle: AtomicU64,
}

impl Inner {
    fn is_live(&self, id: u64) -> bool {
        self.live_loops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&id)
    }
}

impl BusExecutor {
    /// Spawn the worker task and return a handle to it.
    ///
    /// The worker exits when every handle clone has been dropped and the
    /// queue has drained.
    pub fn spawn(name: impl Into<String>) -> Self {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        let worker_name = name.clone();
        tokio::spawn(async move {
            debug!(executor = %worker_name, "Bus executor started");
            while let Some(job) = rx.recv().await {
                job.await;
            }
            debug!(executor = %worker_name, "Bus executor stopped");
        });

        Self {
            inner: Arc::new(Inner {
                name,
                tx,
                live_loops: Mutex::new(HashSet::new()),
                next_handle: AtomicU64::new(1),
            }),
        }
    }

    /// Enqueue a one-shot job.
    ///
    /// Runs exactly once, in FIFO order relative to every other job and
    /// loop tick on this executor. Never blocks the caller.
    pub fn submit<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.inner.tx.send(Box::pin(job)).is_err() {
            trace!(executor = %self.inner.name, "Job dropped, executor is gone");
        }
    }

    /// Register a periodic loop.
    ///
    /// `make_tick` produces one job per tick; the first tick is enqueued
    /// immediately, then every `period`. Period clamping is the caller's
    /// responsibility.
    pub fn start_loop<F, Fut>(&self, period: Duration, make_tick: F) -> LoopHandle
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
        self.inner
            .live_loops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);

        // The ticker only holds a weak reference so it dies with the
        // executor instead of keeping the worker alive.
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if !inner.is_live(id) {
                    break;
                }
                let tick = make_tick();
                let guard = Arc::clone(&inner);
                let job: Job = Box::pin(async move {
                    // Re-checked on the worker: a tick enqueued just
                    // before stop_loop must not run after it.
                    if guard.is_live(id) {
                        tick.await;
                    }
                });
                if inner.tx.send(job).is_err() {
                    break;
                }
            }
            trace!(handle = id, "Loop ticker exited");
        });

        LoopHandle(id)
    }

    /// Cancel a loop.
    ///
    /// Advisory-at-next-boundary: a tick already running is allowed to
    /// finish; no new tick runs once the cancellation is observed.
    /// Idempotent — stopping an unknown or already-stopped handle is a
    /// no-op.
    pub fn stop_loop(&self, handle: LoopHandle) {
        self.inner
            .live_loops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.0);
    }

    /// Wait until every job submitted before this call has run.
    pub async fn drain(&self) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.submit(async move {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }
}
