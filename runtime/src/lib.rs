//! # User Sync Runtime
//!
//! The moving parts of the synchronization pipeline, written against the traits in
//! `user-sync-core` so they run unchanged over AMQP + PostgreSQL or the in-memory
//! doubles from `user-sync-testing`.
//!
//! ## Core Components
//!
//! - **[`ConnectionManager`]**: opens a broker session with bounded retry
//! - **[`Publisher`]**: fans one event out to every destination queue
//! - **[`Consumer`]**: decodes, checks and applies deliveries, then acks or nacks
//!
//! ## Example
//!
//! ```ignore
//! use user_sync_runtime::{ConnectionManager, Consumer, ConsumerSpec};
//!
//! let broker = ConnectionManager::new(connector, config.broker).connect().await?;
//! let spec = ConsumerSpec::for_action(Action::Create, "user", &DEFAULT_SUBSYSTEMS);
//! Consumer::new(Arc::new(broker), store, spec).run().await?;
//! ```

/// Retry policy and fixed-delay/backoff retry loop
pub mod retry;

/// Bounded-retry broker connection
pub mod connection;

/// Fan-out publisher
pub mod publisher;

/// Generic per-action consumer
pub mod consumer;

/// Prometheus metrics for observability
pub mod metrics;

pub use connection::ConnectionManager;
pub use consumer::{Consumer, ConsumerSpec, ConsumerStats, Disposition};
pub use publisher::{PublishReport, Publisher};
pub use retry::RetryPolicy;
