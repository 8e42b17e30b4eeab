//! Acknowledgment aggregation for courier.
//!
//! Instead of one confirmation frame per message, confirmations are queued
//! per destination and flushed as a single BATCH_ACK when the batch reaches
//! the size threshold or the flush timer anchored at the first enqueue
//! expires, whichever comes first.

use crate::session::SessionRegistry;
use courier_protocol::Message;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Aggregation tuning.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Batch size that triggers an immediate flush.
    pub batch_size: usize,
    /// How long a non-empty batch may wait before being flushed.
    pub flush_after: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_after: Duration::from_secs(5),
        }
    }
}

/// Pending confirmations for one destination.
#[derive(Default)]
struct AckQueue {
    /// Ids awaiting confirmation, in enqueue order.
    ids: Vec<String>,
    /// Bumped on every flush; a timer armed for an earlier epoch is stale.
    epoch: u64,
}

/// Batches acknowledgments per destination, flushing by size or time.
///
/// Cloning is cheap and shares the queues; each flush timer task holds its
/// own clone.
#[derive(Clone)]
pub struct AckAggregator {
    queues: Arc<DashMap<String, AckQueue>>,
    /// Resolves the destination's connection at flush time.
    registry: Arc<SessionRegistry>,
    config: AggregatorConfig,
}

impl AckAggregator {
    /// Create an aggregator over the given registry.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, config: AggregatorConfig) -> Self {
        info!(
            batch_size = config.batch_size,
            flush_after_ms = config.flush_after.as_millis() as u64,
            "Creating ack aggregator"
        );
        Self {
            queues: Arc::new(DashMap::new()),
            registry,
            config,
        }
    }

    /// Queue a confirmation of `message_id` toward `destination`.
    ///
    /// The first id since the last flush arms the flush timer; reaching the
    /// size threshold flushes immediately and the superseded timer firing
    /// becomes a no-op.
    pub async fn enqueue(&self, destination: &str, message_id: impl Into<String>) {
        let flush_now = {
            let mut entry = self.queues.entry(destination.to_string()).or_default();
            entry.ids.push(message_id.into());

            if entry.ids.len() == 1 {
                let aggregator = self.clone();
                let target = destination.to_string();
                let epoch = entry.epoch;
                tokio::spawn(async move {
                    tokio::time::sleep(aggregator.config.flush_after).await;
                    aggregator.flush_epoch(&target, epoch).await;
                });
            }

            entry.ids.len() >= self.config.batch_size
        };

        if flush_now {
            self.flush(destination).await;
        }
    }

    /// Flush `destination`'s batch now. Flushing an empty or unknown
    /// destination is a no-op.
    pub async fn flush(&self, destination: &str) {
        if let Some(batch) = self.take_batch(destination, None) {
            self.deliver(destination, batch).await;
        }
    }

    /// Ids currently queued for `destination`.
    #[must_use]
    pub fn queued_count(&self, destination: &str) -> usize {
        self.queues
            .get(destination)
            .map(|entry| entry.ids.len())
            .unwrap_or(0)
    }

    /// Timer-driven flush: only acts if the batch it was armed for has not
    /// already been flushed.
    async fn flush_epoch(&self, destination: &str, epoch: u64) {
        if let Some(batch) = self.take_batch(destination, Some(epoch)) {
            self.deliver(destination, batch).await;
        }
    }

    /// Atomically swap the queue for an empty one; ids enqueued during frame
    /// construction start a new batch.
    fn take_batch(&self, destination: &str, expected_epoch: Option<u64>) -> Option<Vec<String>> {
        let mut entry = self.queues.get_mut(destination)?;
        if let Some(expected) = expected_epoch {
            if entry.epoch != expected {
                return None;
            }
        }
        if entry.ids.is_empty() {
            return None;
        }
        entry.epoch += 1;
        Some(std::mem::take(&mut entry.ids))
    }

    async fn deliver(&self, destination: &str, ids: Vec<String>) {
        debug!(user = %destination, count = ids.len(), "Flushing ack batch");
        match self.registry.lookup(destination) {
            Some(connection) if connection.is_open() => {
                let frame = Message::batch_ack(destination, ids);
                if let Err(e) = connection.send(&frame).await {
                    warn!(user = %destination, error = %e, "Batch ack write failed");
                }
            }
            _ => {
                debug!(user = %destination, dropped = ids.len(), "Destination offline, dropping ack batch");
            }
        }
    }
}
