//! # User Sync Testing
//!
//! Testing utilities for the user synchronization pipeline.
//!
//! This crate provides:
//! - [`InMemoryBroker`] and [`InMemoryConnector`]: exchange/queue/binding semantics with
//!   a settlement log and failure injection
//! - [`InMemoryUserStore`]: the relational mirror without a database
//! - [`FixedClock`]: deterministic time
//! - [`fixtures`]: canned lifecycle events
//!
//! ## Example
//!
//! ```ignore
//! use user_sync_testing::{InMemoryBroker, InMemoryUserStore, test_clock};
//!
//! #[tokio::test]
//! async fn create_then_consume() {
//!     let broker = InMemoryBroker::new();
//!     let store = InMemoryUserStore::new();
//!
//!     publisher.publish(&fixtures::alice_create(), &destinations).await;
//!     consumer.run().await?;
//!
//!     assert_eq!(store.len(), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use user_sync_core::environment::Clock;

pub mod broker;
pub mod fixtures;
pub mod store;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use user_sync_testing::mocks::FixedClock;
    /// use user_sync_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-06-01 12:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::from_timestamp(1_748_779_200, 0).unwrap_or_default())
    }
}

pub use broker::{InMemoryBroker, InMemoryConnector, Settlement, SettlementKind};
pub use mocks::{FixedClock, test_clock};
pub use store::InMemoryUserStore;
