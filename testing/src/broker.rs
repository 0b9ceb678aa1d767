//! In-memory message broker for fast, deterministic tests.
//!
//! Models the parts of an AMQP broker the pipeline relies on:
//! - topic exchanges that route to bound queues (`*` and `#` wildcards supported)
//! - durable queues holding messages until consumed
//! - manual acknowledgement, recorded in a settlement log for assertions
//!
//! Unlike a real broker, a consume stream ends once its queues are drained, so a
//! consumer's `run()` returns after processing everything that was published.

use futures::stream;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use user_sync_core::broker::{
    Acknowledger, BrokerError, BrokerFuture, Connector, Delivery, DeliveryStream, MessageBroker,
    OutgoingMessage,
};
use user_sync_core::config::BrokerConfig;

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Routing key it was published with.
    pub routing_key: String,
    /// The message as published.
    pub message: OutgoingMessage,
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementKind {
    /// Acknowledged.
    Ack,
    /// Negatively acknowledged without requeue.
    Nack,
}

/// One entry of the settlement log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    /// Queue the delivery came from.
    pub queue: String,
    /// Delivery tag.
    pub delivery_tag: u64,
    /// Ack or nack.
    pub kind: SettlementKind,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: HashMap<String, VecDeque<QueuedMessage>>,
    bindings: HashMap<String, Vec<(String, String)>>,
    next_delivery_tag: u64,
    settlements: Vec<Settlement>,
    failing_routing_keys: HashSet<String>,
    failing_exchange_declare: bool,
    failing_acks: bool,
}

/// In-memory [`MessageBroker`]. Clones share state.
///
/// # Example
///
/// ```
/// use user_sync_testing::InMemoryBroker;
/// use user_sync_core::broker::{MessageBroker, OutgoingMessage};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// broker.declare_exchange("user").await?;
/// broker.declare_queue("crm_user_create").await?;
/// broker.bind_queue("crm_user_create", "user", "crm.user.create").await?;
///
/// let message = OutgoingMessage::persistent(b"<UserMessage/>".to_vec(), "text/xml");
/// broker.publish("user", "crm.user.create", &message).await?;
///
/// assert_eq!(broker.queue_len("crm_user_create"), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every publish under `routing_key` fail.
    pub fn fail_publish_to(&self, routing_key: &str) {
        self.lock().failing_routing_keys.insert(routing_key.to_string());
    }

    /// Make exchange declarations fail.
    pub fn fail_exchange_declare(&self) {
        self.lock().failing_exchange_declare = true;
    }

    /// Make every ack and nack fail.
    pub fn fail_acks(&self) {
        self.lock().failing_acks = true;
    }

    /// Whether `exchange` has been declared.
    #[must_use]
    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.lock().exchanges.contains(exchange)
    }

    /// Whether `queue` has been declared.
    #[must_use]
    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Routing keys `queue` is bound under on `exchange`.
    #[must_use]
    pub fn bindings(&self, exchange: &str, queue: &str) -> Vec<String> {
        self.lock()
            .bindings
            .get(exchange)
            .map(|bindings| {
                bindings
                    .iter()
                    .filter(|(_, bound)| bound == queue)
                    .map(|(key, _)| key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of messages waiting in `queue`.
    #[must_use]
    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Messages waiting in `queue`, oldest first.
    #[must_use]
    pub fn messages(&self, queue: &str) -> Vec<QueuedMessage> {
        self.lock()
            .queues
            .get(queue)
            .map(|messages| messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every ack and nack so far, in order.
    #[must_use]
    pub fn settlements(&self) -> Vec<Settlement> {
        self.lock().settlements.clone()
    }

    /// Number of settlements of `kind`.
    #[must_use]
    pub fn settled(&self, kind: SettlementKind) -> usize {
        self.lock().settlements.iter().filter(|s| s.kind == kind).count()
    }

    /// Put a raw payload straight into `queue`, bypassing exchanges.
    pub fn inject(&self, queue: &str, routing_key: &str, payload: impl Into<Vec<u8>>) {
        let message = QueuedMessage {
            routing_key: routing_key.to_string(),
            message: OutgoingMessage::persistent(payload, "text/xml"),
        };
        self.lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(message);
    }

    fn next_delivery(&self, queues: &[String], cursor: &mut usize) -> Option<Delivery> {
        let mut state = self.lock();
        for offset in 0..queues.len() {
            let index = (*cursor + offset) % queues.len();
            let queue = &queues[index];
            let Some(queued) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
                continue;
            };

            *cursor = index + 1;
            state.next_delivery_tag += 1;
            let delivery_tag = state.next_delivery_tag;
            let acker = InMemoryAcker {
                state: Arc::clone(&self.state),
                queue: queue.clone(),
                delivery_tag,
            };
            return Some(Delivery::new(
                queue.clone(),
                queued.routing_key,
                delivery_tag,
                queued.message.payload,
                Box::new(acker),
            ));
        }
        None
    }
}

impl MessageBroker for InMemoryBroker {
    fn declare_exchange(&self, exchange: &str) -> BrokerFuture<'_, ()> {
        let exchange = exchange.to_string();
        Box::pin(async move {
            let mut state = self.lock();
            if state.failing_exchange_declare {
                return Err(BrokerError::DeclareFailed {
                    name: exchange,
                    reason: "injected failure".to_string(),
                });
            }
            state.exchanges.insert(exchange);
            Ok(())
        })
    }

    fn declare_queue(&self, queue: &str) -> BrokerFuture<'_, ()> {
        let queue = queue.to_string();
        Box::pin(async move {
            self.lock().queues.entry(queue).or_default();
            Ok(())
        })
    }

    fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerFuture<'_, ()> {
        let queue = queue.to_string();
        let exchange = exchange.to_string();
        let routing_key = routing_key.to_string();
        Box::pin(async move {
            let mut state = self.lock();
            if !state.exchanges.contains(&exchange) {
                return Err(BrokerError::BindFailed {
                    queue,
                    routing_key,
                    reason: format!("no exchange '{exchange}'"),
                });
            }
            if !state.queues.contains_key(&queue) {
                return Err(BrokerError::BindFailed {
                    reason: format!("no queue '{queue}'"),
                    queue,
                    routing_key,
                });
            }
            let bindings = state.bindings.entry(exchange).or_default();
            let binding = (routing_key, queue);
            if !bindings.contains(&binding) {
                bindings.push(binding);
            }
            Ok(())
        })
    }

    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutgoingMessage,
    ) -> BrokerFuture<'_, ()> {
        let exchange = exchange.to_string();
        let routing_key = routing_key.to_string();
        let message = message.clone();
        Box::pin(async move {
            let mut state = self.lock();
            if state.failing_routing_keys.contains(&routing_key) || !state.exchanges.contains(&exchange) {
                return Err(BrokerError::PublishFailed {
                    reason: format!("exchange '{exchange}' rejected the message"),
                    routing_key,
                });
            }

            let targets: Vec<String> = state
                .bindings
                .get(&exchange)
                .map(|bindings| {
                    bindings
                        .iter()
                        .filter(|(pattern, _)| topic_matches(pattern, &routing_key))
                        .map(|(_, queue)| queue.clone())
                        .collect()
                })
                .unwrap_or_default();

            for queue in targets {
                state.queues.entry(queue).or_default().push_back(QueuedMessage {
                    routing_key: routing_key.clone(),
                    message: message.clone(),
                });
            }
            Ok(())
        })
    }

    fn consume(&self, queues: &[&str]) -> BrokerFuture<'_, DeliveryStream> {
        let queues: Vec<String> = queues.iter().map(|s| (*s).to_string()).collect();
        Box::pin(async move {
            let missing: Vec<String> = {
                let state = self.lock();
                queues
                    .iter()
                    .filter(|queue| !state.queues.contains_key(*queue))
                    .cloned()
                    .collect()
            };
            if !missing.is_empty() {
                return Err(BrokerError::ConsumeFailed {
                    queues: missing,
                    reason: "queue not declared".to_string(),
                });
            }

            let broker = self.clone();
            let deliveries = stream::unfold(0_usize, move |mut cursor| {
                let next = if queues.is_empty() {
                    None
                } else {
                    broker.next_delivery(&queues, &mut cursor)
                };
                async move { next.map(|delivery| (Ok::<_, BrokerError>(delivery), cursor)) }
            });
            Ok(Box::pin(deliveries) as DeliveryStream)
        })
    }
}

struct InMemoryAcker {
    state: Arc<Mutex<BrokerState>>,
    queue: String,
    delivery_tag: u64,
}

impl InMemoryAcker {
    fn settle(&self, kind: SettlementKind) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.failing_acks {
            return Err(BrokerError::AckFailed {
                delivery_tag: self.delivery_tag,
                reason: "injected failure".to_string(),
            });
        }
        state.settlements.push(Settlement {
            queue: self.queue.clone(),
            delivery_tag: self.delivery_tag,
            kind,
        });
        Ok(())
    }
}

impl Acknowledger for InMemoryAcker {
    fn ack(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move { self.settle(SettlementKind::Ack) })
    }

    fn nack(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move { self.settle(SettlementKind::Nack) })
    }
}

/// AMQP topic matching: `*` matches one word, `#` zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.split_first(), key.split_first()) {
            (None, None) => true,
            (Some((&"#", rest)), _) => {
                matches(rest, key) || (!key.is_empty() && matches(pattern, &key[1..]))
            },
            (Some((&"*", rest)), Some((_, key_rest))) => matches(rest, key_rest),
            (Some((word, rest)), Some((key_word, key_rest))) => {
                word == key_word && matches(rest, key_rest)
            },
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// [`Connector`] handing out clones of one [`InMemoryBroker`].
///
/// Can be told to fail a number of times first, to exercise connection retry.
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
    failures_left: Arc<AtomicU32>,
    attempts: Arc<AtomicU32>,
}

impl InMemoryConnector {
    /// Connector that always succeeds.
    #[must_use]
    pub fn new(broker: InMemoryBroker) -> Self {
        Self {
            broker,
            failures_left: Arc::new(AtomicU32::new(0)),
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Fail the next `failures` connection attempts.
    #[must_use]
    pub fn failing(self, failures: u32) -> Self {
        self.failures_left.store(failures, Ordering::SeqCst);
        self
    }

    /// Connection attempts made so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for InMemoryConnector {
    type Broker = InMemoryBroker;

    fn connect<'a>(&'a self, config: &'a BrokerConfig) -> BrokerFuture<'a, Self::Broker> {
        Box::pin(async move {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let failed = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failed {
                return Err(BrokerError::ConnectionFailed(format!(
                    "{}:{} refused connection (attempt {attempt})",
                    config.host, config.port
                )));
            }
            Ok(self.broker.clone())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code: failures surface as assertion panics
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("crm.user.create", "crm.user.create"));
        assert!(!topic_matches("crm.user.create", "crm.user.update"));
        assert!(topic_matches("*.user.create", "kassa.user.create"));
        assert!(topic_matches("crm.#", "crm.user.delete"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("*.user", "crm.user.create"));
    }

    #[tokio::test]
    async fn publish_routes_only_to_bound_queues() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("user").await.unwrap();
        broker.declare_queue("crm_user_create").await.unwrap();
        broker.declare_queue("crm_user_delete").await.unwrap();
        broker
            .bind_queue("crm_user_create", "user", "crm.user.create")
            .await
            .unwrap();
        broker
            .bind_queue("crm_user_delete", "user", "crm.user.delete")
            .await
            .unwrap();

        let message = OutgoingMessage::persistent(b"x".to_vec(), "text/xml");
        broker.publish("user", "crm.user.create", &message).await.unwrap();

        assert_eq!(broker.queue_len("crm_user_create"), 1);
        assert_eq!(broker.queue_len("crm_user_delete"), 0);
    }

    #[tokio::test]
    async fn binding_twice_is_idempotent() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("user").await.unwrap();
        broker.declare_queue("kassa_user_update").await.unwrap();
        for _ in 0..2 {
            broker
                .bind_queue("kassa_user_update", "user", "kassa.user.update")
                .await
                .unwrap();
        }

        assert_eq!(broker.bindings("user", "kassa_user_update"), vec!["kassa.user.update"]);
    }

    #[tokio::test]
    async fn consume_drains_queues_and_records_settlements() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("a").await.unwrap();
        broker.declare_queue("b").await.unwrap();
        broker.inject("a", "a.key", b"1".to_vec());
        broker.inject("b", "b.key", b"2".to_vec());
        broker.inject("a", "a.key", b"3".to_vec());

        let mut stream = broker.consume(&["a", "b"]).await.unwrap();
        let mut payloads = Vec::new();
        while let Some(delivery) = stream.next().await {
            let delivery = delivery.unwrap();
            payloads.push(delivery.payload.clone());
            if delivery.queue == "b" {
                delivery.nack().await.unwrap();
            } else {
                delivery.ack().await.unwrap();
            }
        }

        assert_eq!(payloads.len(), 3);
        assert_eq!(broker.settled(SettlementKind::Ack), 2);
        assert_eq!(broker.settled(SettlementKind::Nack), 1);
        assert_eq!(broker.queue_len("a"), 0);
    }

    #[tokio::test]
    async fn consume_rejects_undeclared_queue() {
        let broker = InMemoryBroker::new();
        let err = broker.consume(&["nope"]).await.err().unwrap();
        assert!(matches!(err, BrokerError::ConsumeFailed { .. }));
    }

    #[tokio::test]
    async fn connector_fails_requested_number_of_times() {
        let connector = InMemoryConnector::new(InMemoryBroker::new()).failing(2);
        let config = BrokerConfig::default();

        assert!(connector.connect(&config).await.is_err());
        assert!(connector.connect(&config).await.is_err());
        assert!(connector.connect(&config).await.is_ok());
        assert_eq!(connector.attempts(), 3);
    }
}
