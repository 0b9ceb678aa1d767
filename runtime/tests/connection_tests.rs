//! Integration tests for bounded-retry broker connection

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use std::time::Duration;
use user_sync_core::config::BrokerConfig;
use user_sync_core::error::SyncError;
use user_sync_runtime::{ConnectionManager, RetryPolicy};
use user_sync_testing::{InMemoryBroker, InMemoryConnector};

fn fast_policy(attempts: u32) -> RetryPolicy {
    RetryPolicy::fixed(attempts, Duration::from_millis(1))
}

#[tokio::test]
async fn test_connects_after_transient_failures() {
    let connector = InMemoryConnector::new(InMemoryBroker::new()).failing(3);
    let manager =
        ConnectionManager::new(connector.clone(), BrokerConfig::default()).with_policy(fast_policy(10));

    let result = manager.connect().await;

    assert!(result.is_ok());
    assert_eq!(connector.attempts(), 4);
}

#[tokio::test]
async fn test_exhausted_budget_is_broker_unavailable() {
    let connector = InMemoryConnector::new(InMemoryBroker::new()).failing(u32::MAX);
    let manager =
        ConnectionManager::new(connector.clone(), BrokerConfig::default()).with_policy(fast_policy(5));

    let err = manager.connect().await.err().unwrap();

    match err {
        SyncError::BrokerUnavailable { attempts, reason } => {
            assert_eq!(attempts, 5);
            assert!(reason.contains("localhost:5672"));
        },
        other => panic!("expected BrokerUnavailable, got {other:?}"),
    }
    assert_eq!(connector.attempts(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_default_policy_waits_five_seconds_between_attempts() {
    let connector = InMemoryConnector::new(InMemoryBroker::new()).failing(2);
    let manager = ConnectionManager::new(connector.clone(), BrokerConfig::default());
    assert_eq!(manager.policy().max_attempts, 10);

    let started = tokio::time::Instant::now();
    manager.connect().await.unwrap();

    assert_eq!(connector.attempts(), 3);
    assert!(started.elapsed() >= Duration::from_secs(10));
}
