//! Worker pool and the per-record dispatch loop.
//!
//! Each worker repeatedly takes one record off the queue, advances it by one
//! step and either retires it or puts it back at the end of the queue. A
//! small pool can therefore serve any number of open connections, each
//! getting a bounded slice of attention per pass.

use crate::config::Config;
use crate::connection::{ConnectionRecord, ConnectionState};
use crate::forwarder::Forwarder;
use crate::initializer::Initializer;
use crate::metrics::EngineMetrics;
use crate::queue::WorkQueue;
use crate::resolver::Resolver;
use crate::shutdown::ShutdownSignal;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// What a single step did to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The record needs more steps.
    Requeue { idle: bool },
    /// The record is `Complete` or `Failed`.
    Retire,
}

/// Shared, stateless step logic used by every worker.
pub struct Dispatcher {
    initializer: Initializer,
    forwarder: Forwarder,
    metrics: Arc<EngineMetrics>,
    relay_buffer_size: usize,
}

impl Dispatcher {
    pub fn new(config: &Config, resolver: Arc<dyn Resolver>, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            initializer: Initializer::new(resolver, config),
            forwarder: Forwarder::new(metrics.clone()),
            metrics,
            relay_buffer_size: config.relay_buffer_size.max(1),
        }
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    /// Scratch buffer for one worker's relay passes.
    pub fn relay_buffer(&self) -> Vec<u8> {
        vec![0u8; self.relay_buffer_size]
    }

    /// Advance `record` by one step according to its state.
    pub async fn step(&self, record: &mut ConnectionRecord, buf: &mut [u8]) -> StepOutcome {
        let idle = match record.state() {
            ConnectionState::Uninitialized => {
                self.initializer.initialize(record).await;
                false
            }
            ConnectionState::Forwarding => self.forwarder.forward(record, buf).await.is_idle(),
            ConnectionState::Complete | ConnectionState::Failed => true,
        };

        if record.state().is_terminal() {
            StepOutcome::Retire
        } else {
            StepOutcome::Requeue { idle }
        }
    }

    /// Close both sockets of a finished record and discard it.
    pub fn retire(&self, record: ConnectionRecord) -> usize {
        let id = record.id();
        let state = record.state();
        let closed = record.retire();
        debug!(
            "{}: retired as {}, {} socket(s) closed, {} connection(s) active",
            id,
            state,
            closed,
            self.metrics.active_connections()
        );
        closed
    }
}

/// Fixed set of worker tasks sharing one queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        count: usize,
        queue: Arc<WorkQueue>,
        dispatcher: Arc<Dispatcher>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let handles = (0..count)
            .map(|worker_id| {
                let queue = queue.clone();
                let dispatcher = dispatcher.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    run_worker(worker_id, queue, dispatcher, shutdown).await;
                })
            })
            .collect();

        info!("Started {} worker(s)", count);
        Self { handles }
    }

    /// A pool with no workers, useful when records are only ever drained.
    pub fn empty() -> Self {
        Self { handles: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait up to `grace` for every worker to leave its loop, then abort the
    /// rest. An aborted worker drops the record it holds, closing its
    /// sockets. Returns the number of workers aborted.
    pub async fn join(self, grace: Duration) -> usize {
        let mut handles = self.handles;
        let mut joined = 0;
        let finished = tokio::time::timeout(grace, async {
            while joined < handles.len() {
                if let Err(e) = (&mut handles[joined]).await {
                    if e.is_panic() {
                        warn!("Worker panicked: {}", e);
                    }
                }
                joined += 1;
            }
        })
        .await;

        if finished.is_ok() {
            return 0;
        }

        // Handles before `joined` have completed and must not be polled again.
        let remaining = handles.split_off(joined);
        let aborted = remaining.len();
        for handle in &remaining {
            handle.abort();
        }
        // Let aborted tasks unwind so their records are dropped before we return.
        futures::future::join_all(remaining).await;
        warn!("Aborted {} worker(s) still busy after {:?}", aborted, grace);
        aborted
    }
}

async fn run_worker(
    worker_id: usize,
    queue: Arc<WorkQueue>,
    dispatcher: Arc<Dispatcher>,
    shutdown: ShutdownSignal,
) {
    debug!("Worker {} started", worker_id);
    let mut buf = dispatcher.relay_buffer();

    while !shutdown.is_triggered() {
        let Some(mut record) = queue.dequeue().await else {
            break;
        };

        match dispatcher.step(&mut record, &mut buf).await {
            StepOutcome::Retire => {
                dispatcher.retire(record);
            }
            StepOutcome::Requeue { idle } => {
                queue.enqueue(record);
                if idle {
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}
