//! Shutdown coordination.
//!
//! ```text
//! signal -> Shutdown::trigger (flag only)
//!        -> acceptor stops, workers leave their loop after the current step
//!        -> ShutdownCoordinator::drain: close queue, join workers, retire
//!           every record still queued
//! ```

use crate::queue::WorkQueue;
use crate::worker::WorkerPool;
use log::{debug, info};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tokio::sync::watch;

pub const SIGINT: i32 = 2;
pub const SIGTERM: i32 = 15;

/// Process-wide stop flag. Cloning shares the same flag.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

struct Inner {
    tx: watch::Sender<bool>,
    signal: AtomicI32,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                tx,
                signal: AtomicI32::new(0),
            }),
        }
    }

    /// Raise the stop flag. Only records state; all teardown happens in
    /// `ShutdownCoordinator::drain`.
    pub fn trigger(&self, signum: i32) {
        let _ = self.inner.signal.compare_exchange(0, signum, Ordering::SeqCst, Ordering::SeqCst);
        self.inner.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.tx.borrow()
    }

    /// Number of the signal that triggered shutdown, if any.
    pub fn signal_number(&self) -> Option<i32> {
        match self.inner.signal.load(Ordering::SeqCst) {
            0 => None,
            n => Some(n),
        }
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.inner.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of the stop flag, held by the acceptor and each worker.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn triggered(&mut self) {
        // An error means the sender is gone, which only happens at teardown.
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Records still queued when the workers stopped.
    pub records_drained: usize,
    /// Sockets closed while retiring those records.
    pub sockets_closed: usize,
    /// Workers aborted because they were still busy after the grace period.
    pub workers_aborted: usize,
}

pub struct ShutdownCoordinator {
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Stop the workers and retire everything left in `queue`.
    pub async fn drain(&self, queue: &WorkQueue, workers: WorkerPool) -> DrainReport {
        info!("Draining: {} queued record(s), {} worker(s)", queue.len(), workers.len());

        queue.close();
        let workers_aborted = workers.join(self.grace).await;

        let mut report = DrainReport {
            workers_aborted,
            ..DrainReport::default()
        };
        for record in queue.drain() {
            let id = record.id();
            report.sockets_closed += record.retire();
            report.records_drained += 1;
            debug!("{}: force-closed during drain", id);
        }

        info!(
            "Drain complete: {} record(s) retired, {} socket(s) closed",
            report.records_drained, report.sockets_closed
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_is_visible_to_subscribers() {
        let shutdown = Shutdown::new();
        let signal = shutdown.subscribe();
        assert!(!signal.is_triggered());
        assert_eq!(shutdown.signal_number(), None);

        shutdown.trigger(SIGINT);
        assert!(signal.is_triggered());
        assert!(shutdown.clone().is_triggered());
        assert_eq!(shutdown.signal_number(), Some(SIGINT));
    }

    #[test]
    fn test_first_signal_wins() {
        let shutdown = Shutdown::new();
        shutdown.trigger(SIGTERM);
        shutdown.trigger(SIGINT);
        assert_eq!(shutdown.signal_number(), Some(SIGTERM));
    }

    #[tokio::test]
    async fn test_triggered_resolves_after_trigger() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.subscribe();

        let waiter = tokio::spawn(async move {
            signal.triggered().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        shutdown.trigger(SIGINT);
        tokio::time::timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_drain_with_no_workers_and_empty_queue() {
        let queue = WorkQueue::new();
        let report = ShutdownCoordinator::new(Duration::from_millis(10))
            .drain(&queue, WorkerPool::empty())
            .await;
        assert_eq!(report, DrainReport::default());
        assert!(queue.is_closed());
    }
}
