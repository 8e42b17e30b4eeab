//! Test doubles shared by the core test modules.

use crate::connection::{Connection, ConnectionError};
use async_trait::async_trait;
use courier_protocol::Message;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// In-memory connection that records every frame written to it.
#[derive(Default)]
pub struct FakeConnection {
    sent: Mutex<Vec<Message>>,
    open: AtomicBool,
    failing: AtomicBool,
    close_calls: AtomicUsize,
}

impl FakeConnection {
    pub fn open() -> Arc<Self> {
        let conn = Self::default();
        conn.open.store(true, Ordering::Release);
        Arc::new(conn)
    }

    /// Make subsequent sends fail (or succeed again) without closing.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Release);
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn send(&self, message: &Message) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }
        if self.failing.load(Ordering::Acquire) {
            return Err(ConnectionError::SendFailed("simulated failure".into()));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.open.store(false, Ordering::Release);
        self.close_calls.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
