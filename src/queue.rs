//! Shared work queue between the acceptor and the worker pool.

use crate::connection::ConnectionRecord;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// FIFO of connection records awaiting their next step.
///
/// `enqueue` never blocks. `dequeue` parks the calling task on a `Notify`
/// until a record is available or the queue has been closed, so idle
/// workers cost nothing.
pub struct WorkQueue {
    records: Mutex<VecDeque<ConnectionRecord>>,
    notify: Notify,
    closed: AtomicBool,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Push a record to the back of the queue.
    ///
    /// Records are still accepted after `close`; they stay queued until
    /// `drain` removes them.
    pub fn enqueue(&self, record: ConnectionRecord) {
        self.lock().push_back(record);
        self.notify.notify_one();
    }

    /// Wait for the next record. Returns `None` once the queue is closed.
    pub async fn dequeue(&self) -> Option<ConnectionRecord> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a close() in between is not missed.
            notified.as_mut().enable();

            if self.is_closed() {
                return None;
            }
            if let Some(record) = self.lock().pop_front() {
                return Some(record);
            }

            notified.await;
        }
    }

    /// Stop handing out work and wake every parked worker.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remove and return every queued record.
    pub fn drain(&self) -> Vec<ConnectionRecord> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<ConnectionRecord>> {
        // A panic while holding the lock cannot leave the deque half-updated.
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::EngineMetrics;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    async fn record(metrics: &Arc<EngineMetrics>) -> (ConnectionRecord, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (accepted, peer) = listener.accept().await.unwrap();
        (ConnectionRecord::new(accepted, peer, metrics.clone()), client)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let metrics = Arc::new(EngineMetrics::new());
        let queue = WorkQueue::new();
        let (first, _c1) = record(&metrics).await;
        let (second, _c2) = record(&metrics).await;
        let (first_id, second_id) = (first.id(), second.id());

        queue.enqueue(first);
        queue.enqueue(second);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.dequeue().await.unwrap().id(), first_id);
        assert_eq!(queue.dequeue().await.unwrap().id(), second_id);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_enqueue() {
        let metrics = Arc::new(EngineMetrics::new());
        let queue = Arc::new(WorkQueue::new());

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await.map(|r| r.id()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        let (rec, _client) = record(&metrics).await;
        let id = rec.id();
        queue.enqueue(rec);

        let got = tokio::time::timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
        assert_eq!(got, Some(id));
    }

    #[tokio::test]
    async fn test_close_wakes_every_waiter() {
        let queue = Arc::new(WorkQueue::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.dequeue().await.is_none() })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        for waiter in waiters {
            let woke_empty = tokio::time::timeout(Duration::from_secs(2), waiter)
                .await
                .unwrap()
                .unwrap();
            assert!(woke_empty);
        }
    }

    #[tokio::test]
    async fn test_closed_queue_keeps_records_for_drain() {
        let metrics = Arc::new(EngineMetrics::new());
        let queue = WorkQueue::new();
        let (rec, _client) = record(&metrics).await;

        queue.close();
        queue.enqueue(rec);

        assert!(queue.dequeue().await.is_none());
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());
    }
}
