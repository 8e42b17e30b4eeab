//! Envelope types for the courier protocol.
//!
//! Every frame on the wire is a JSON object with a stable field set; fields
//! that do not apply to a given kind are omitted. Unknown fields are ignored
//! on decode so older servers tolerate newer clients.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Message kind identifiers (the wire `type` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Point-to-point chat message.
    Chat,
    /// Confirmation of a single message id.
    Ack,
    /// Confirmation of a batch of message ids.
    BatchAck,
    /// User came online.
    Login,
    /// User went offline.
    Logout,
    /// Recipient has read a message.
    ReadReceipt,
    /// Client keepalive probe.
    Heartbeat,
    /// Server reply to a keepalive probe.
    HeartbeatResponse,
    /// Snapshot of currently online users.
    UserList,
    /// Failure report scoped to one message.
    Error,
}

/// Delivery lifecycle of a chat message.
///
/// The sequence is `Sending -> Sent -> Delivered -> Read`, with `Failed` as
/// the terminal branch after retry exhaustion. `Read` only ever follows
/// `Delivered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Whether the status may advance to `next` under the monotonic
    /// lifecycle rules.
    #[must_use]
    pub fn may_advance_to(self, next: MessageStatus) -> bool {
        use MessageStatus::{Delivered, Failed, Read, Sending, Sent};
        match (self, next) {
            (Sending, Sent | Delivered | Failed)
            | (Sent, Delivered | Failed)
            | (Delivered, Read) => true,
            _ => false,
        }
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Read | MessageStatus::Failed)
    }
}

/// Generate a fresh globally unique message id.
#[must_use]
pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// A protocol envelope.
///
/// The same struct carries every kind; constructors populate the fields a
/// kind uses and leave the rest absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Globally unique message id, assigned once at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// Sender identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Recipient identity; absent for broadcast frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    /// Opaque payload for chat, human-readable text for errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Milliseconds since the Unix epoch, stamped at send time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,

    /// Whether the recipient must confirm this message.
    #[serde(default, skip_serializing_if = "is_false")]
    pub need_ack: bool,

    /// Delivery lifecycle status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,

    /// For `Ack` frames, the id being confirmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_message_id: Option<String>,

    /// For `BatchAck` frames, the ids being confirmed, in enqueue order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_ack_message_ids: Option<Vec<String>>,

    /// For `UserList` frames, the snapshot of online identities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<String>>,
}

impl Message {
    /// Create a bare envelope of the given kind, stamped with the current
    /// time.
    #[must_use]
    pub fn new(kind: MessageKind) -> Self {
        Self {
            id: None,
            kind,
            from: None,
            to: None,
            content: None,
            timestamp: Some(now_millis()),
            need_ack: false,
            status: None,
            ack_message_id: None,
            batch_ack_message_ids: None,
            users: None,
        }
    }

    /// Create a chat message with a fresh id, requesting acknowledgment.
    #[must_use]
    pub fn chat(
        from: impl Into<String>,
        to: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut message = Self::new(MessageKind::Chat);
        message.id = Some(new_message_id());
        message.from = Some(from.into());
        message.to = Some(to.into());
        message.content = Some(content.into());
        message.need_ack = true;
        message.status = Some(MessageStatus::Sending);
        message
    }

    /// Create a single-id confirmation addressed to `to`.
    #[must_use]
    pub fn ack(
        to: impl Into<String>,
        ack_message_id: impl Into<String>,
        status: MessageStatus,
    ) -> Self {
        let mut message = Self::new(MessageKind::Ack);
        message.to = Some(to.into());
        message.ack_message_id = Some(ack_message_id.into());
        message.status = Some(status);
        message
    }

    /// Create a batch confirmation carrying `ids` in enqueue order.
    #[must_use]
    pub fn batch_ack(to: impl Into<String>, ids: Vec<String>) -> Self {
        let mut message = Self::new(MessageKind::BatchAck);
        message.to = Some(to.into());
        message.status = Some(MessageStatus::Delivered);
        message.batch_ack_message_ids = Some(ids);
        message
    }

    /// Create a presence-online broadcast for `identity`.
    #[must_use]
    pub fn login(identity: impl Into<String>) -> Self {
        let mut message = Self::new(MessageKind::Login);
        message.from = Some(identity.into());
        message
    }

    /// Create a presence-offline broadcast for `identity`.
    #[must_use]
    pub fn logout(identity: impl Into<String>) -> Self {
        let mut message = Self::new(MessageKind::Logout);
        message.from = Some(identity.into());
        message
    }

    /// Create an online-roster broadcast.
    #[must_use]
    pub fn user_list(users: Vec<String>) -> Self {
        let mut message = Self::new(MessageKind::UserList);
        message.users = Some(users);
        message
    }

    /// Create a keepalive reply.
    #[must_use]
    pub fn heartbeat_response() -> Self {
        Self::new(MessageKind::HeartbeatResponse)
    }

    /// Create a failure report addressed to `to`.
    #[must_use]
    pub fn error(to: impl Into<String>, content: impl Into<String>) -> Self {
        let mut message = Self::new(MessageKind::Error);
        message.to = Some(to.into());
        message.content = Some(content.into());
        message.status = Some(MessageStatus::Failed);
        message
    }

    /// Correlate this envelope with the message id it reports on.
    #[must_use]
    pub fn with_ack_target(mut self, id: impl Into<String>) -> Self {
        self.ack_message_id = Some(id.into());
        self
    }

    /// Set the sender identity.
    #[must_use]
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_constructor() {
        let message = Message::chat("alice", "bob", "hi");
        assert_eq!(message.kind, MessageKind::Chat);
        assert!(message.id.is_some());
        assert!(message.need_ack);
        assert_eq!(message.status, Some(MessageStatus::Sending));
        assert_eq!(message.from.as_deref(), Some("alice"));
        assert_eq!(message.to.as_deref(), Some("bob"));
    }

    #[test]
    fn test_unique_message_ids() {
        let a = Message::chat("alice", "bob", "one");
        let b = Message::chat("alice", "bob", "two");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_wire_field_names() {
        let message = Message::ack("alice", "m-1", MessageStatus::Delivered);
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&message).unwrap()).unwrap();

        assert_eq!(json["type"], "ACK");
        assert_eq!(json["ackMessageId"], "m-1");
        assert_eq!(json["status"], "DELIVERED");
        // Fields that do not apply are omitted entirely
        assert!(json.get("batchAckMessageIds").is_none());
        assert!(json.get("needAck").is_none());
        assert!(json.get("content").is_none());
    }

    #[test]
    fn test_batch_ack_preserves_order() {
        let ids = vec!["m-1".to_string(), "m-2".to_string(), "m-3".to_string()];
        let message = Message::batch_ack("carol", ids.clone());
        assert_eq!(message.kind, MessageKind::BatchAck);
        assert_eq!(message.batch_ack_message_ids, Some(ids));
    }

    #[test]
    fn test_status_lifecycle() {
        use MessageStatus::{Delivered, Failed, Read, Sending, Sent};

        assert!(Sending.may_advance_to(Sent));
        assert!(Sent.may_advance_to(Delivered));
        assert!(Delivered.may_advance_to(Read));
        assert!(Sending.may_advance_to(Failed));

        // Read only follows Delivered, and terminal states stay put
        assert!(!Sending.may_advance_to(Read));
        assert!(!Sent.may_advance_to(Read));
        assert!(!Read.may_advance_to(Sent));
        assert!(!Failed.may_advance_to(Sent));
        assert!(Read.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Delivered.is_terminal());
    }
}
