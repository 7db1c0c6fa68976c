use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, instrument, warn};
use volley_core::{fire_order, metrics, Error};

use crate::dispatch::{Dispatcher, FireTicket};

/// Outcome of flushing one or more partition batches.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub fired: usize,
    pub failed: usize,
    /// Tickets released without firing because shutdown was requested.
    pub aborted: usize,
}

impl FlushReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.aborted == 0
    }

    fn merge(&mut self, other: FlushReport) {
        self.fired += other.fired;
        self.failed += other.failed;
        self.aborted += other.aborted;
    }
}

/// Per-partition queue of claimed instances, drained in firing order.
///
/// Enqueueing is concurrent; a flush takes the partition's whole batch, sorts
/// it and fires it one instance at a time, so one partition always emits in
/// non-decreasing fire time. Flushes of the same partition are serialized.
pub struct FireBuffer {
    dispatcher: Arc<Dispatcher>,
    queues: Mutex<HashMap<String, Vec<FireTicket>>>,
    flush_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    max_batch_size: usize,
    wake: Arc<Notify>,
}

impl FireBuffer {
    pub fn new(dispatcher: Arc<Dispatcher>, max_batch_size: usize) -> Self {
        Self {
            dispatcher,
            queues: Mutex::new(HashMap::new()),
            flush_locks: Mutex::new(HashMap::new()),
            max_batch_size: max_batch_size.max(1),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Wakes the auto-flusher early once a partition batch is full.
    pub fn wake(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Queues `ticket` for the next flush. Once shutdown is requested the
    /// ticket is dropped instead, releasing its instance, and `false` is returned.
    pub fn add_cache(&self, ticket: FireTicket) -> bool {
        let queued = {
            let mut queues = self.queues.lock();
            // checked under the queue lock so release_all cannot miss a late ticket
            if self.dispatcher.is_shutdown() {
                debug!(instance_id = %ticket.id(), "shutdown requested, not buffering");
                return false;
            }
            let queue = queues.entry(ticket.instance.partition.clone()).or_default();
            queue.push(ticket);
            queue.len()
        };
        if queued >= self.max_batch_size {
            self.wake.notify_one();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.queues.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn partitions(&self) -> Vec<String> {
        self.queues
            .lock()
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(p, _)| p.clone())
            .collect()
    }

    fn flush_lock(&self, partition: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.flush_locks
            .lock()
            .entry(partition.to_string())
            .or_default()
            .clone()
    }

    #[instrument(name = "flush_partition", skip(self))]
    pub async fn flush_partition(&self, partition: &str) -> FlushReport {
        let lock = self.flush_lock(partition);
        let _flushing = lock.lock().await;

        let mut batch = self.queues.lock().remove(partition).unwrap_or_default();
        if batch.is_empty() {
            return FlushReport::default();
        }
        batch.sort_by(|a, b| fire_order(&a.instance, &b.instance));

        let mut report = FlushReport::default();
        for ticket in batch {
            match self.dispatcher.fire(ticket).await {
                Ok(_) => report.fired += 1,
                Err(Error::Shutdown) => report.aborted += 1,
                Err(_) => report.failed += 1,
            }
        }

        if report.is_success() {
            metrics::BUFFER_FLUSHES.with_label_values(&["ok"]).inc();
            debug!(partition, fired = report.fired, "flushed fire buffer");
        } else {
            metrics::BUFFER_FLUSHES.with_label_values(&["failed"]).inc();
            warn!(
                partition,
                fired = report.fired,
                failed = report.failed,
                aborted = report.aborted,
                "fire buffer flush incomplete"
            );
        }
        report
    }

    /// Flushes every non-empty partition; partitions are flushed concurrently.
    pub async fn flush_all(&self) -> FlushReport {
        let partitions = self.partitions();
        let reports = futures::future::join_all(partitions.iter().map(|p| self.flush_partition(p))).await;
        let mut total = FlushReport::default();
        for r in reports {
            total.merge(r);
        }
        total
    }

    /// Drops every queued ticket, returning their instances to pending.
    pub fn release_all(&self) -> usize {
        let drained: Vec<FireTicket> = self.queues.lock().drain().flat_map(|(_, q)| q).collect();
        drained.len()
    }
}
