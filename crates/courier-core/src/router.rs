//! Inbound frame routing for courier.
//!
//! The router is a state-free dispatcher: it classifies each inbound frame
//! by kind and hands it to the registry, the delivery engine, or the ack
//! aggregator. The match is exhaustive, so adding a kind is a compile error
//! until every dispatch path handles it.

use crate::ack::AckAggregator;
use crate::connection::Connection;
use crate::delivery::DeliveryEngine;
use crate::session::SessionRegistry;
use crate::storage::PersistHandle;
use courier_protocol::{Message, MessageKind, MessageStatus};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Classifies inbound frames and dispatches them to the core components.
pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
    delivery: Arc<DeliveryEngine>,
    aggregator: Arc<AckAggregator>,
    persist: PersistHandle,
}

impl MessageRouter {
    /// Wire up a router over the shared core components.
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        delivery: Arc<DeliveryEngine>,
        aggregator: Arc<AckAggregator>,
        persist: PersistHandle,
    ) -> Self {
        Self {
            registry,
            delivery,
            aggregator,
            persist,
        }
    }

    /// Install a session for `identity` and announce it to everyone.
    pub async fn connection_opened(&self, identity: &str, connection: Arc<dyn Connection>) {
        self.registry.connect(identity, connection).await;
        info!(user = %identity, online = self.registry.count(), "User connected");

        self.registry.broadcast(&Message::login(identity)).await;
        self.registry
            .broadcast(&Message::user_list(self.registry.snapshot()))
            .await;
    }

    /// Tear down the session when `connection`'s read task ends.
    ///
    /// A no-op if the identity has already reconnected on a newer
    /// connection.
    pub async fn connection_closed(&self, identity: &str, connection: &Arc<dyn Connection>) {
        if self.registry.disconnect_connection(identity, connection) {
            info!(user = %identity, online = self.registry.count(), "User disconnected");
            self.registry.broadcast(&Message::logout(identity)).await;
        }
    }

    /// Dispatch one inbound frame from the connection bound to `identity`.
    pub async fn dispatch(
        &self,
        identity: &str,
        connection: &Arc<dyn Connection>,
        frame: Message,
    ) {
        match frame.kind {
            MessageKind::Chat => self.handle_chat(identity, connection, frame).await,

            MessageKind::Ack => match frame.ack_message_id.as_deref() {
                Some(id) => self.retire(id).await,
                None => warn!(user = %identity, "Ack frame without ackMessageId, dropping"),
            },

            MessageKind::BatchAck => {
                for id in frame.batch_ack_message_ids.unwrap_or_default() {
                    self.retire(&id).await;
                }
            }

            MessageKind::Login => {
                self.connection_opened(identity, Arc::clone(connection)).await;
            }

            MessageKind::Logout => {
                if self.registry.disconnect(identity) {
                    info!(user = %identity, "User logged out");
                    self.registry.broadcast(&Message::logout(identity)).await;
                }
            }

            MessageKind::Heartbeat => {
                if let Err(e) = connection.send(&Message::heartbeat_response()).await {
                    debug!(user = %identity, error = %e, "Heartbeat reply failed");
                }
            }

            MessageKind::ReadReceipt => self.forward_read_receipt(identity, frame).await,

            // Server-originated kinds carry no inbound action
            MessageKind::HeartbeatResponse | MessageKind::UserList | MessageKind::Error => {
                debug!(user = %identity, kind = ?frame.kind, "Ignoring inbound frame");
            }
        }
    }

    async fn handle_chat(
        &self,
        identity: &str,
        sender: &Arc<dyn Connection>,
        mut message: Message,
    ) {
        // The connection's bound identity is authoritative for the sender
        message.from = Some(identity.to_string());

        let Some(recipient) = message.to.clone() else {
            warn!(user = %identity, "Chat without recipient, dropping");
            return;
        };

        match self.registry.lookup(&recipient) {
            Some(connection) if connection.is_open() => {
                let mut sent = self.delivery.send(message, &connection).await;
                let id = sent.id.clone().unwrap_or_default();

                // The frame is on its way; tell the sender so
                let notice = Message::ack(identity, id.clone(), MessageStatus::Sent);
                if let Err(e) = sender.send(&notice).await {
                    debug!(user = %identity, error = %e, "Could not confirm send");
                }

                sent.status = Some(MessageStatus::Sent);
                self.persist.enqueue(sent);
            }
            _ => {
                warn!(user = %identity, recipient = %recipient, "Recipient offline, rejecting chat");
                let mut notice = Message::error(identity, "User is offline");
                if let Some(id) = message.id {
                    notice = notice.with_ack_target(id);
                }
                if let Err(e) = sender.send(&notice).await {
                    debug!(user = %identity, error = %e, "Could not surface routing failure");
                }
            }
        }
    }

    /// Retire a pending delivery and queue the batched DELIVERED
    /// confirmation for its original sender.
    async fn retire(&self, id: &str) {
        if let Some(retired) = self.delivery.acknowledge(id) {
            if let Some(origin) = retired.from {
                self.aggregator.enqueue(&origin, id).await;
            }
        }
    }

    async fn forward_read_receipt(&self, identity: &str, mut frame: Message) {
        frame.from = Some(identity.to_string());

        let Some(target) = frame.to.clone() else {
            warn!(user = %identity, "Read receipt without target, dropping");
            return;
        };

        match self.registry.lookup(&target) {
            Some(connection) if connection.is_open() => {
                if let Err(e) = connection.send(&frame).await {
                    warn!(user = %target, error = %e, "Read receipt forward failed");
                }
            }
            _ => debug!(user = %target, "Read receipt target offline, dropping"),
        }
    }
}
