//! # courier-core
//!
//! Session routing and delivery reliability for the courier realtime layer.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **SessionRegistry** - Maps user identities to live connections
//! - **DeliveryEngine** - At-least-once delivery with timed retries
//! - **AckAggregator** - Batches delivery confirmations per destination
//! - **MessageRouter** - Classifies inbound frames and dispatches them
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Router    │────▶│  Registry   │
//! └─────────────┘     └──────┬──────┘     └─────────────┘
//!                            │
//!                     ┌──────┴──────┐
//!                     ▼             ▼
//!              ┌───────────┐ ┌────────────┐
//!              │ Delivery  │ │ Aggregator │
//!              └───────────┘ └────────────┘
//! ```
//!
//! The transport terminating client sockets and the storage backend are
//! collaborators behind the [`Connection`] and [`Storage`] traits; the core
//! never parses transport framing and never awaits persistence.

pub mod ack;
pub mod connection;
pub mod delivery;
pub mod router;
pub mod session;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

pub use ack::{AckAggregator, AggregatorConfig};
pub use connection::{Connection, ConnectionError};
pub use delivery::{DeliveryConfig, DeliveryEngine};
pub use router::MessageRouter;
pub use session::SessionRegistry;
pub use storage::{spawn_persist_worker, MemoryStorage, PersistHandle, Storage, StorageError};
