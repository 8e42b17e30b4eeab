//! Delivery reliability engine for courier.
//!
//! Chat messages that request acknowledgment are tracked in a pending map
//! keyed by message id and retransmitted on a fixed-delay timer until the
//! recipient confirms them, the retry budget runs out, or the recipient is
//! found gone. The pending map is the single source of truth: removing an
//! entry is how a retry timer is cancelled, and the first remover wins.

use crate::connection::Connection;
use crate::session::SessionRegistry;
use courier_protocol::{new_message_id, now_millis, Message, MessageStatus};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delivery reliability configuration.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Fixed delay between delivery attempts.
    pub retry_delay: Duration,
    /// Maximum number of retries after the initial send.
    pub max_retries: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(3),
            max_retries: 3,
        }
    }
}

/// One outstanding chat message awaiting acknowledgment.
struct PendingDelivery {
    /// The envelope as sent; retransmissions reuse it verbatim.
    message: Message,
    /// Retries performed so far (the initial send is not counted).
    attempts: u32,
    /// The retry timer driving this entry.
    retry_task: JoinHandle<()>,
}

/// Tracks unacknowledged sends and retries them on a timer.
///
/// Cloning is cheap and shares the pending map; each retry timer task holds
/// its own clone.
#[derive(Clone)]
pub struct DeliveryEngine {
    /// Pending deliveries keyed by message id.
    pending: Arc<DashMap<String, PendingDelivery>>,
    /// Used to re-resolve the destination's current connection at retry time.
    registry: Arc<SessionRegistry>,
    config: DeliveryConfig,
}

impl DeliveryEngine {
    /// Create an engine over the given registry.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, config: DeliveryConfig) -> Self {
        info!(
            retry_delay_ms = config.retry_delay.as_millis() as u64,
            max_retries = config.max_retries,
            "Creating delivery engine"
        );
        Self {
            pending: Arc::new(DashMap::new()),
            registry,
            config,
        }
    }

    /// Send `message` reliably to `connection`.
    ///
    /// Assigns a fresh id if the envelope has none, stamps the timestamp,
    /// records a pending delivery, and arms the retry timer. The timer is
    /// armed whether or not the initial write succeeds: the recipient may
    /// reconnect before the next attempt.
    ///
    /// Returns the envelope as sent.
    pub async fn send(&self, mut message: Message, connection: &Arc<dyn Connection>) -> Message {
        let id = match message.id.clone() {
            Some(id) => id,
            None => {
                let id = new_message_id();
                message.id = Some(id.clone());
                id
            }
        };
        message.timestamp = Some(now_millis());
        message.need_ack = true;
        message.status = Some(MessageStatus::Sending);

        let retry_task = self.spawn_retry(id.clone());
        let previous = self.pending.insert(
            id.clone(),
            PendingDelivery {
                message: message.clone(),
                attempts: 0,
                retry_task,
            },
        );
        if let Some(previous) = previous {
            // One pending entry per id; a duplicate send supersedes the
            // earlier timer.
            warn!(id = %id, "Duplicate send for pending id, superseding");
            previous.retry_task.abort();
        }
        debug!(id = %id, pending = self.pending.len(), "Tracking delivery");

        if let Err(e) = connection.send(&message).await {
            warn!(id = %id, error = %e, "Initial delivery write failed, will retry");
        }

        message
    }

    /// Confirm delivery of `id`.
    ///
    /// Removes the pending entry and cancels its timer. A missing id is a
    /// no-op, never an error: late and duplicate acks are expected under
    /// retry.
    ///
    /// Returns the retired envelope, marked delivered, if this call resolved
    /// it.
    pub fn acknowledge(&self, id: &str) -> Option<Message> {
        let (_, mut entry) = self.pending.remove(id)?;
        entry.retry_task.abort();
        entry.message.status = Some(MessageStatus::Delivered);
        debug!(id = %id, retries = entry.attempts, "Delivery acknowledged");
        Some(entry.message)
    }

    /// Confirm delivery of every id in `ids`.
    ///
    /// Ids with no pending entry are skipped; partial presence is normal.
    pub fn acknowledge_batch(&self, ids: &[String]) -> Vec<Message> {
        ids.iter()
            .filter_map(|id| self.acknowledge(id))
            .collect()
    }

    /// Whether `id` is still awaiting acknowledgment.
    #[must_use]
    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Number of deliveries awaiting acknowledgment.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Cancel every outstanding retry timer and drop all pending state.
    pub fn shutdown(&self) {
        for entry in self.pending.iter() {
            entry.retry_task.abort();
        }
        self.pending.clear();
        info!("Delivery engine shut down");
    }

    fn spawn_retry(&self, id: String) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(engine.config.retry_delay).await;
                if !engine.retry_once(&id).await {
                    break;
                }
            }
        })
    }

    /// One timer firing. Returns `false` once the entry is resolved and the
    /// timer should stop.
    async fn retry_once(&self, id: &str) -> bool {
        // Absence of the entry is the cancellation signal.
        let message = match self.pending.get(id) {
            None => return false,
            Some(entry) => {
                if entry.attempts >= self.config.max_retries {
                    drop(entry);
                    self.fail(id, "retry limit exceeded").await;
                    return false;
                }
                entry.message.clone()
            }
        };

        // Always re-resolve through the registry: the connection captured at
        // send time may have been replaced or closed since.
        let destination = message.to.as_deref().unwrap_or_default();
        let connection = match self.registry.lookup(destination) {
            Some(connection) if connection.is_open() => connection,
            _ => {
                self.fail(id, "destination offline").await;
                return false;
            }
        };

        let attempt = match self.pending.get_mut(id) {
            // Acknowledged while we resolved the connection
            None => return false,
            Some(mut entry) => {
                entry.attempts += 1;
                entry.attempts
            }
        };

        debug!(id = %id, attempt, "Retrying delivery");
        if let Err(e) = connection.send(&message).await {
            warn!(id = %id, attempt, error = %e, "Retry write failed");
        }
        true
    }

    /// Terminal failure path: drop the entry and surface FAILED to the
    /// sender if they are online.
    async fn fail(&self, id: &str, reason: &str) {
        // An ack may have won the race; first remover wins.
        let Some((_, mut entry)) = self.pending.remove(id) else {
            return;
        };
        entry.message.status = Some(MessageStatus::Failed);
        error!(id = %id, reason, retries = entry.attempts, "Delivery failed");

        if let Some(sender) = entry.message.from.clone() {
            if let Some(connection) = self.registry.lookup(&sender) {
                let notice = Message::ack(sender.clone(), id, MessageStatus::Failed);
                if let Err(e) = connection.send(&notice).await {
                    debug!(user = %sender, error = %e, "Could not surface delivery failure");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeConnection;
    use courier_protocol::MessageKind;

    fn engine_with(registry: &Arc<SessionRegistry>) -> Arc<DeliveryEngine> {
        Arc::new(DeliveryEngine::new(
            Arc::clone(registry),
            DeliveryConfig::default(),
        ))
    }

    async fn settle() {
        // Let freshly woken timer tasks run to completion.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_stamps_envelope() {
        let registry = Arc::new(SessionRegistry::new());
        let engine = engine_with(&registry);
        let bob = FakeConnection::open();

        let mut message = Message::new(MessageKind::Chat);
        message.from = Some("alice".into());
        message.to = Some("bob".into());
        message.content = Some("hi".into());

        let sent = engine
            .send(message, &(bob.clone() as Arc<dyn Connection>))
            .await;

        assert!(sent.id.is_some());
        assert!(sent.need_ack);
        assert_eq!(sent.status, Some(MessageStatus::Sending));
        assert!(engine.is_pending(sent.id.as_deref().unwrap()));
        assert_eq!(bob.sent_count(), 1);

        engine.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_before_retry_fires_no_retransmission() {
        let registry = Arc::new(SessionRegistry::new());
        let engine = engine_with(&registry);
        let bob = FakeConnection::open();
        registry.connect("bob", bob.clone() as Arc<dyn Connection>).await;

        let sent = engine
            .send(
                Message::chat("alice", "bob", "hi"),
                &(bob.clone() as Arc<dyn Connection>),
            )
            .await;
        let id = sent.id.as_deref().unwrap();

        let retired = engine.acknowledge(id).unwrap();
        assert_eq!(retired.status, Some(MessageStatus::Delivered));
        assert!(!engine.is_pending(id));

        // No retry ever fires, even well past the retry window
        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(bob.sent_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledge_is_idempotent() {
        let registry = Arc::new(SessionRegistry::new());
        let engine = engine_with(&registry);
        let bob = FakeConnection::open();
        registry.connect("bob", bob.clone() as Arc<dyn Connection>).await;

        let sent = engine
            .send(
                Message::chat("alice", "bob", "hi"),
                &(bob.clone() as Arc<dyn Connection>),
            )
            .await;
        let id = sent.id.clone().unwrap();

        assert!(engine.acknowledge(&id).is_some());
        assert!(engine.acknowledge(&id).is_none());
        assert!(engine.acknowledge("never-sent").is_none());
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_delivery_retries_then_fails() {
        let registry = Arc::new(SessionRegistry::new());
        let engine = engine_with(&registry);
        let alice = FakeConnection::open();
        let bob = FakeConnection::open();
        registry.connect("alice", alice.clone() as Arc<dyn Connection>).await;
        registry.connect("bob", bob.clone() as Arc<dyn Connection>).await;

        let sent = engine
            .send(
                Message::chat("alice", "bob", "hi"),
                &(bob.clone() as Arc<dyn Connection>),
            )
            .await;
        let id = sent.id.clone().unwrap();

        // Initial send plus max_retries retransmissions
        for attempt in 1..=3u64 {
            tokio::time::sleep(Duration::from_secs(3)).await;
            settle().await;
            assert_eq!(bob.sent_count(), 1 + attempt as usize);
        }

        // The next firing exhausts the budget: entry dropped, FAILED surfaced
        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;
        assert!(!engine.is_pending(&id));

        let notices = alice.sent();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].kind, MessageKind::Ack);
        assert_eq!(notices[0].status, Some(MessageStatus::Failed));
        assert_eq!(notices[0].ack_message_id.as_deref(), Some(&*id));

        // Never resends after FAILED
        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(bob.sent_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_discovers_closed_destination() {
        let registry = Arc::new(SessionRegistry::new());
        let engine = engine_with(&registry);
        let bob = FakeConnection::open();
        registry.connect("bob", bob.clone() as Arc<dyn Connection>).await;

        let sent = engine
            .send(
                Message::chat("alice", "bob", "hi"),
                &(bob.clone() as Arc<dyn Connection>),
            )
            .await;
        let id = sent.id.clone().unwrap();

        // The connection dies after the initial send; closure is discovered
        // lazily at the next firing
        bob.set_open(false);
        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;

        assert!(!engine.is_pending(&id));
        assert_eq!(bob.sent_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_uses_current_connection_after_reconnect() {
        let registry = Arc::new(SessionRegistry::new());
        let engine = engine_with(&registry);
        let old_bob = FakeConnection::open();
        registry.connect("bob", old_bob.clone() as Arc<dyn Connection>).await;

        engine
            .send(
                Message::chat("alice", "bob", "hi"),
                &(old_bob.clone() as Arc<dyn Connection>),
            )
            .await;

        // Bob reconnects before the first retry
        let new_bob = FakeConnection::open();
        registry.connect("bob", new_bob.clone() as Arc<dyn Connection>).await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;

        // The retransmission went to the replacement, not the stale handle
        assert_eq!(old_bob.sent_count(), 1);
        assert_eq!(new_bob.sent_count(), 1);

        engine.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_initial_write_still_retries() {
        let registry = Arc::new(SessionRegistry::new());
        let engine = engine_with(&registry);
        let bob = FakeConnection::open();
        bob.set_failing(true);
        registry.connect("bob", bob.clone() as Arc<dyn Connection>).await;

        let sent = engine
            .send(
                Message::chat("alice", "bob", "hi"),
                &(bob.clone() as Arc<dyn Connection>),
            )
            .await;

        assert_eq!(bob.sent_count(), 0);
        assert!(engine.is_pending(sent.id.as_deref().unwrap()));

        // The write path recovers; the armed timer delivers
        bob.set_failing(false);
        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(bob.sent_count(), 1);

        engine.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledge_batch_with_partial_presence() {
        let registry = Arc::new(SessionRegistry::new());
        let engine = engine_with(&registry);
        let bob = FakeConnection::open();
        registry.connect("bob", bob.clone() as Arc<dyn Connection>).await;

        let first = engine
            .send(
                Message::chat("alice", "bob", "one"),
                &(bob.clone() as Arc<dyn Connection>),
            )
            .await;
        let second = engine
            .send(
                Message::chat("alice", "bob", "two"),
                &(bob.clone() as Arc<dyn Connection>),
            )
            .await;

        let ids = vec![
            first.id.clone().unwrap(),
            "unknown-id".to_string(),
            second.id.clone().unwrap(),
        ];
        let retired = engine.acknowledge_batch(&ids);

        assert_eq!(retired.len(), 2);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_all_timers() {
        let registry = Arc::new(SessionRegistry::new());
        let engine = engine_with(&registry);
        let bob = FakeConnection::open();
        registry.connect("bob", bob.clone() as Arc<dyn Connection>).await;

        for i in 0..5 {
            engine
                .send(
                    Message::chat("alice", "bob", format!("msg {i}")),
                    &(bob.clone() as Arc<dyn Connection>),
                )
                .await;
        }
        assert_eq!(engine.pending_count(), 5);

        engine.shutdown();
        assert_eq!(engine.pending_count(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(bob.sent_count(), 5);
    }
}
