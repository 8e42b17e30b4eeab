//! Session registry for courier.
//!
//! The registry maps each user identity to its single live connection and is
//! the authority on who is online. All operations are safe under concurrent
//! calls from different connection tasks and timer callbacks.

use crate::connection::Connection;
use courier_protocol::Message;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registry of live sessions, one per identity.
///
/// An identity reconnecting replaces its previous session (last-connect-wins):
/// the stale connection is closed best-effort before the new handle is
/// installed, trading a possible last-message loss on the stale side for
/// availability.
#[derive(Default)]
pub struct SessionRegistry {
    /// Live connections indexed by identity.
    sessions: DashMap<String, Arc<dyn Connection>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a session for `identity`, closing any previous one first.
    ///
    /// Close failures are logged, never surfaced; the new session is
    /// installed regardless.
    pub async fn connect(&self, identity: impl Into<String>, connection: Arc<dyn Connection>) {
        let identity = identity.into();

        if let Some((_, stale)) = self.sessions.remove(&identity) {
            info!(user = %identity, "Replacing existing session");
            if let Err(e) = stale.close().await {
                warn!(user = %identity, error = %e, "Failed to close stale connection");
            }
        }

        self.sessions.insert(identity.clone(), connection);
        debug!(user = %identity, online = self.sessions.len(), "Session installed");
    }

    /// Remove the session for `identity`, if present. Idempotent.
    ///
    /// Returns `true` if a session was removed.
    pub fn disconnect(&self, identity: &str) -> bool {
        let removed = self.sessions.remove(identity).is_some();
        if removed {
            debug!(user = %identity, online = self.sessions.len(), "Session removed");
        }
        removed
    }

    /// Remove the session for `identity` only if it still holds `connection`.
    ///
    /// A replaced session's old read task must not evict its replacement, so
    /// teardown paths that act on behalf of a specific connection use this
    /// instead of [`disconnect`](Self::disconnect).
    pub fn disconnect_connection(
        &self,
        identity: &str,
        connection: &Arc<dyn Connection>,
    ) -> bool {
        self.sessions
            .remove_if(identity, |_, current| Arc::ptr_eq(current, connection))
            .is_some()
    }

    /// Look up the current connection for `identity`.
    #[must_use]
    pub fn lookup(&self, identity: &str) -> Option<Arc<dyn Connection>> {
        self.sessions.get(identity).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether `identity` has a live session.
    #[must_use]
    pub fn is_online(&self, identity: &str) -> bool {
        self.sessions.contains_key(identity)
    }

    /// Number of live sessions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Identities of all live sessions.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Send `message` to every open session.
    ///
    /// A failed write to one session is logged and skipped; it never aborts
    /// delivery to the others. Only the destination's own write lock is taken
    /// per send, so one slow peer cannot stall the rest.
    pub async fn broadcast(&self, message: &Message) {
        let targets: Vec<(String, Arc<dyn Connection>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        for (identity, connection) in targets {
            if !connection.is_open() {
                continue;
            }
            if let Err(e) = connection.send(message).await {
                warn!(user = %identity, error = %e, "Broadcast write failed, skipping");
            }
        }
    }
}
