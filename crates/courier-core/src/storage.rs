//! Storage collaborator seam and the fire-and-forget persistence queue.
//!
//! The delivery path never waits on storage: messages are handed to a worker
//! task over a channel, and persistence failures are logged, never surfaced
//! to the protocol layer.

use async_trait::async_trait;
use courier_protocol::{Message, MessageStatus};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend unreachable.
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),

    /// Write rejected by the backend.
    #[error("Storage write failed: {0}")]
    WriteFailed(String),
}

/// Durable message store.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Append one message.
    async fn persist(&self, message: &Message) -> Result<(), StorageError>;

    /// Conversation history between two users, most recent first.
    async fn history(
        &self,
        user_a: &str,
        user_b: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError>;

    /// Messages addressed to `user` that have not been read, most recent
    /// first.
    async fn unread(&self, user: &str) -> Result<Vec<Message>, StorageError>;
}

/// Handle for queueing messages onto the persistence worker.
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl PersistHandle {
    /// Queue a message for persistence without waiting for the write.
    pub fn enqueue(&self, message: Message) {
        if self.tx.send(message).is_err() {
            debug!("Persistence worker stopped, dropping message");
        }
    }
}

/// Spawn the persistence worker draining queued messages into `storage`.
///
/// The worker outlives individual failures: a rejected write is logged and
/// the next message is processed.
pub fn spawn_persist_worker(storage: Arc<dyn Storage>) -> (PersistHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = storage.persist(&message).await {
                error!(id = ?message.id, error = %e, "Failed to persist message");
            }
        }
        debug!("Persistence worker drained");
    });
    (PersistHandle { tx }, task)
}

/// In-memory store keeping messages in arrival order.
#[derive(Default)]
pub struct MemoryStorage {
    messages: Mutex<Vec<Message>>,
}

impl MemoryStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn persist(&self, message: &Message) -> Result<(), StorageError> {
        self.messages.lock().await.push(message.clone());
        Ok(())
    }

    async fn history(
        &self,
        user_a: &str,
        user_b: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError> {
        let messages = self.messages.lock().await;
        let mut matching: Vec<Message> = messages
            .iter()
            .filter(|m| {
                let from = m.from.as_deref();
                let to = m.to.as_deref();
                (from == Some(user_a) && to == Some(user_b))
                    || (from == Some(user_b) && to == Some(user_a))
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn unread(&self, user: &str) -> Result<Vec<Message>, StorageError> {
        let messages = self.messages.lock().await;
        let mut matching: Vec<Message> = messages
            .iter()
            .filter(|m| {
                m.to.as_deref() == Some(user) && m.status != Some(MessageStatus::Read)
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(matching)
    }
}
