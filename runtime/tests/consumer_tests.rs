//! Integration tests for the generic consumer
//!
//! Each test seeds queues on the in-memory broker, runs a consumer until the queues
//! drain, and checks both the store and the settlement log.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use std::sync::Arc;
use user_sync_core::broker::MessageBroker;
use user_sync_core::codec::XmlCodec;
use user_sync_core::error::SyncError;
use user_sync_core::event::{Action, UserLifecycleEvent};
use user_sync_core::routing::DEFAULT_EXCHANGE;
use user_sync_core::store::{ApplyOutcome, StoreError, UserStore};
use user_sync_runtime::{Consumer, ConsumerSpec, ConsumerStats, Disposition};
use user_sync_testing::{
    InMemoryBroker, InMemoryUserStore, SettlementKind, fixtures, test_clock,
};

// ============================================================================
// Test Fixtures
// ============================================================================

struct Harness {
    broker: InMemoryBroker,
    store: InMemoryUserStore,
}

impl Harness {
    fn new() -> Self {
        Self {
            broker: InMemoryBroker::new(),
            store: InMemoryUserStore::new(),
        }
    }

    fn consumer(&self, action: Action, subsystems: &[&str]) -> Consumer {
        let spec = ConsumerSpec::for_action(action, DEFAULT_EXCHANGE, subsystems);
        Consumer::new(
            Arc::new(self.broker.clone()) as Arc<dyn MessageBroker>,
            Arc::new(self.store.clone()) as Arc<dyn UserStore>,
            spec,
        )
        .with_clock(Arc::new(test_clock()))
    }

    fn seed(&self, queue: &str, event: &UserLifecycleEvent) {
        self.broker.inject(queue, "seed", XmlCodec::new().encode(event));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_prepare_binds_every_subsystem_queue() {
    let harness = Harness::new();
    let consumer = harness.consumer(Action::Update, &["crm", "kassa"]);

    consumer.prepare().await.unwrap();

    assert_eq!(
        harness.broker.bindings(DEFAULT_EXCHANGE, "crm_user_update"),
        vec!["crm.user.update"]
    );
    assert_eq!(
        harness.broker.bindings(DEFAULT_EXCHANGE, "kassa_user_update"),
        vec!["kassa.user.update"]
    );
}

#[tokio::test]
async fn test_create_is_applied_and_acked() {
    let harness = Harness::new();
    harness.seed("crm_user_create", &fixtures::alice_create());

    let stats = harness.consumer(Action::Create, &["crm"]).run().await.unwrap();

    assert_eq!(
        stats,
        ConsumerStats {
            applied: 1,
            skipped: 0,
            rejected: 0
        }
    );
    let user = harness.store.user(fixtures::ALICE_EMAIL).unwrap();
    assert_eq!(user.login, "alice");
    assert_eq!(user.display_name, "Alice Smith");
    assert_eq!(user.action_type, Action::Create);
    assert_eq!(harness.broker.settled(SettlementKind::Ack), 1);
}

#[tokio::test]
async fn test_duplicate_create_is_acked_without_second_record() {
    let harness = Harness::new();
    harness.seed("crm_user_create", &fixtures::alice_create());
    harness.seed("crm_user_create", &fixtures::alice_create());

    let stats = harness.consumer(Action::Create, &["crm"]).run().await.unwrap();

    assert_eq!(stats.applied, 2);
    assert_eq!(harness.store.len(), 1);
    assert_eq!(harness.store.writes(), 1);
    assert_eq!(harness.broker.settled(SettlementKind::Ack), 2);
}

#[tokio::test]
async fn test_same_login_on_different_domains_creates_two_users() {
    let harness = Harness::new();
    harness.seed(
        "crm_user_create",
        &fixtures::alice_create().with_email("alice@a.example"),
    );
    harness.seed(
        "crm_user_create",
        &fixtures::alice_create().with_email("alice@b.example"),
    );

    let stats = harness.consumer(Action::Create, &["crm"]).run().await.unwrap();

    assert_eq!(stats.applied, 2);
    assert_eq!(stats.rejected, 0);
    assert_eq!(harness.store.len(), 2);
    assert_eq!(harness.store.user("alice@a.example").unwrap().login, "alice");
    assert_eq!(harness.store.user("alice@b.example").unwrap().login, "alice");
    assert_eq!(harness.broker.settled(SettlementKind::Nack), 0);
}

#[tokio::test]
async fn test_action_mismatch_is_acked_and_skipped() {
    let harness = Harness::new();
    harness.seed("crm_user_create", &fixtures::alice_delete());

    let stats = harness.consumer(Action::Create, &["crm"]).run().await.unwrap();

    assert_eq!(stats.skipped, 1);
    assert!(harness.store.is_empty());
    assert_eq!(harness.store.writes(), 0);
    assert_eq!(harness.broker.settled(SettlementKind::Ack), 1);
    assert_eq!(harness.broker.settled(SettlementKind::Nack), 0);
}

#[tokio::test]
async fn test_action_mismatch_carries_both_actions() {
    let harness = Harness::new();
    let consumer = harness.consumer(Action::Create, &["crm"]);
    let payload = XmlCodec::new().encode(&fixtures::alice_delete());

    let disposition = consumer.process("crm_user_create", payload.as_bytes()).await;

    assert_eq!(
        disposition,
        Disposition::Skipped(SyncError::ActionMismatch {
            expected: Action::Create,
            received: Action::Delete,
        })
    );
    assert!(disposition.acknowledges());
    assert_eq!(disposition.label(), "action_mismatch");
}

#[tokio::test]
async fn test_disposition_labels_name_the_failure_kind() {
    let harness = Harness::new();
    let consumer = harness.consumer(Action::Create, &["crm"]);

    let malformed = consumer.process("crm_user_create", b"<nope").await;
    let applied = consumer
        .process(
            "crm_user_create",
            XmlCodec::new().encode(&fixtures::alice_create()).as_bytes(),
        )
        .await;

    assert_eq!(malformed.label(), "malformed_event");
    assert_eq!(applied.label(), "applied");
}

#[tokio::test]
async fn test_malformed_payload_is_nacked_and_loop_continues() {
    let harness = Harness::new();
    harness.broker.inject("crm_user_create", "seed", "<UserMessage><ActionType>CREATE");
    harness.broker.inject("crm_user_create", "seed", "not xml at all");
    harness.seed("crm_user_create", &fixtures::alice_create());

    let stats = harness.consumer(Action::Create, &["crm"]).run().await.unwrap();

    assert_eq!(stats.rejected, 2);
    assert_eq!(stats.applied, 1);
    assert_eq!(harness.store.len(), 1);
    assert_eq!(harness.broker.settled(SettlementKind::Nack), 2);
}

#[tokio::test]
async fn test_missing_email_is_invalid_and_nacked() {
    let harness = Harness::new();
    let consumer = harness.consumer(Action::Delete, &["kassa"]);
    let event = UserLifecycleEvent::new(Action::Delete, "42", "2025-01-01T00:00:00Z");
    let payload = XmlCodec::new().encode(&event);

    let disposition = consumer.process("kassa_user_delete", payload.as_bytes()).await;

    assert!(matches!(disposition, Disposition::Rejected(SyncError::InvalidEvent(_))));
    assert!(!disposition.acknowledges());
    assert_eq!(disposition.label(), "invalid_event");
}

#[tokio::test]
async fn test_update_of_unknown_user_is_apply_failure() {
    let harness = Harness::new();
    harness.seed("crm_user_update", &fixtures::alice_update_phone("555"));

    let consumer = harness.consumer(Action::Update, &["crm"]);
    let stats = consumer.run().await.unwrap();

    assert_eq!(stats.rejected, 1);
    assert!(harness.store.is_empty());
    assert_eq!(harness.broker.settled(SettlementKind::Nack), 1);
}

#[tokio::test]
async fn test_store_failure_is_nacked_without_side_effects() {
    let harness = Harness::new();
    harness
        .store
        .fail_next(StoreError::Database("deadlock detected".to_string()));
    let consumer = harness.consumer(Action::Create, &["crm"]);
    let payload = XmlCodec::new().encode(&fixtures::alice_create());

    let disposition = consumer.process("crm_user_create", payload.as_bytes()).await;

    assert_eq!(
        disposition,
        Disposition::Rejected(SyncError::ApplyFailure(StoreError::Database(
            "deadlock detected".to_string()
        )))
    );
    assert!(harness.store.is_empty());
}

#[tokio::test]
async fn test_delete_of_unknown_user_is_success() {
    let harness = Harness::new();
    harness.seed("kassa_user_delete", &fixtures::alice_delete());

    let consumer = harness.consumer(Action::Delete, &["kassa"]);
    let payload = XmlCodec::new().encode(&fixtures::alice_delete());
    let disposition = consumer.process("kassa_user_delete", payload.as_bytes()).await;
    assert_eq!(disposition, Disposition::Applied(ApplyOutcome::NotFound));

    let stats = consumer.run().await.unwrap();
    assert_eq!(stats.applied, 1);
    assert_eq!(harness.broker.settled(SettlementKind::Ack), 1);
}

#[tokio::test]
async fn test_consumer_reads_all_bound_queues() {
    let harness = Harness::new();
    harness.seed("crm_user_create", &fixtures::alice_create());
    harness.seed(
        "kassa_user_create",
        &fixtures::alice_create().with_email("bob@example.com"),
    );

    let stats = harness
        .consumer(Action::Create, &["crm", "kassa"])
        .run()
        .await
        .unwrap();

    assert_eq!(stats.applied, 2);
    assert_eq!(harness.store.len(), 2);
}

#[tokio::test]
async fn test_failed_ack_ends_the_session() {
    let harness = Harness::new();
    harness.seed("crm_user_create", &fixtures::alice_create());
    harness.broker.fail_acks();

    let err = harness
        .consumer(Action::Create, &["crm"])
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Broker(_)));
}

#[tokio::test]
async fn test_shutdown_stops_before_next_delivery() {
    let harness = Harness::new();
    harness.seed("crm_user_create", &fixtures::alice_create());

    let stats = harness
        .consumer(Action::Create, &["crm"])
        .run_until(std::future::ready(()))
        .await
        .unwrap();

    assert_eq!(stats.total(), 0);
    assert_eq!(harness.broker.queue_len("crm_user_create"), 1);
    assert!(harness.store.is_empty());
}
