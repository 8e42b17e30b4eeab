//! # courier-protocol
//!
//! Wire protocol definitions for the courier realtime delivery layer.
//!
//! This crate defines the JSON envelope exchanged between clients and the
//! server, including the message kind and status enums and the codec.
//!
//! ## Message Kinds
//!
//! - `Chat` - Point-to-point user messages
//! - `Ack` / `BatchAck` - Delivery confirmations
//! - `Login` / `Logout` / `UserList` - Presence events
//! - `Heartbeat` / `HeartbeatResponse` - Keepalive
//! - `ReadReceipt` / `Error` - Read tracking and failure reports
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, Message};
//!
//! // Create a chat envelope using the helper method
//! let message = Message::chat("alice", "bob", "Hello, world!");
//!
//! // Encode and decode
//! let encoded = codec::encode(&message).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::{new_message_id, now_millis, Message, MessageKind, MessageStatus};
