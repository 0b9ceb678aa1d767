//! # User Sync Core
//!
//! Data model, wire codec and seams for propagating user lifecycle events from an
//! identity source to downstream subsystems.
//!
//! ## Core Concepts
//!
//! - **Lifecycle event**: a CREATE/UPDATE/DELETE notification about a user ([`event`])
//! - **Codec**: the versioned XML wire format, alias-tolerant on decode ([`codec`])
//! - **Broker**: exchange/queue/binding operations and manual acknowledgement ([`broker`])
//! - **Store**: the transactional relational mirror of a user ([`store`])
//! - **Apply**: pure planning of store calls from events ([`apply`])
//!
//! ## Flow
//!
//! ```text
//! identity source ──► Publisher ──► exchange ──► queue per (subsystem, action)
//!                                                     │
//!                              Consumer ◄─────────────┘
//!                                 │ decode → validate → apply
//!                                 ▼
//!                             UserStore ──► ack / nack (no requeue)
//! ```
//!
//! The publisher, consumer and connection manager live in `user-sync-runtime`;
//! adapters for AMQP and PostgreSQL live in their own crates.

pub mod apply;
pub mod broker;
pub mod codec;
pub mod config;
pub mod environment;
pub mod error;
pub mod event;
pub mod routing;
pub mod store;

pub use apply::{ApplyError, apply_event};
pub use broker::{BrokerError, Connector, Delivery, MessageBroker, OutgoingMessage};
pub use codec::{AliasTable, CodecError, XmlCodec};
pub use config::{BrokerConfig, DatabaseConfig};
pub use environment::{Clock, SystemClock};
pub use error::SyncError;
pub use event::{Action, BusinessInfo, UserLifecycleEvent};
pub use routing::{Destination, Destinations};
pub use store::{ApplyOutcome, StoreError, UserRecord, UserStore};
