//! Message broker abstraction for fan-out publishing and queue consumption.
//!
//! This module provides the [`MessageBroker`] trait the publisher and consumers talk to,
//! and the [`Connector`] trait the connection manager uses to open a session.
//!
//! # Topology
//!
//! ```text
//!                    ┌──────────────────┐
//!   publish ────────►│ exchange "user"  │ (topic, durable)
//!                    └────────┬─────────┘
//!        crm.user.create      │      kassa.user.create
//!          ┌──────────────────┼──────────────────┐
//!          ▼                  ▼                  ▼
//!  ┌───────────────┐ ┌──────────────────────┐ ┌─────────────────┐
//!  │crm_user_create│ │facturatie_user_create│ │kassa_user_create│  (durable)
//!  └───────┬───────┘ └──────────┬───────────┘ └────────┬────────┘
//!          └────────────────────┼──────────────────────┘
//!                               ▼
//!                       create consumer
//! ```
//!
//! # Delivery Semantics
//!
//! - **At-least-once**: a delivery that is neither acked nor nacked is redelivered
//!   after the session ends, so consumers must be idempotent.
//! - **No requeue**: [`Delivery::nack`] always discards the message. Failed messages
//!   are replayed by operators, never looped back automatically.
//!
//! # Implementations
//!
//! - `InMemoryBroker` in `user-sync-testing` - for tests
//! - `AmqpBroker` in `user-sync-amqp` - for production (AMQP 0-9-1)

use crate::config::BrokerConfig;
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by broker operations.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Failed to open a connection or channel
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to declare an exchange or queue
    #[error("Declare failed for '{name}': {reason}")]
    DeclareFailed {
        /// Exchange or queue name
        name: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to bind a queue to an exchange
    #[error("Bind failed for queue '{queue}' on '{routing_key}': {reason}")]
    BindFailed {
        /// The queue being bound
        queue: String,
        /// The routing key of the binding
        routing_key: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to publish a message
    #[error("Publish failed for routing key '{routing_key}': {reason}")]
    PublishFailed {
        /// The routing key that failed
        routing_key: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to start consuming from queues
    #[error("Consume failed for queues {queues:?}: {reason}")]
    ConsumeFailed {
        /// The queues that failed
        queues: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Failed to acknowledge or negatively acknowledge a delivery
    #[error("Acknowledgement failed for delivery {delivery_tag}: {reason}")]
    AckFailed {
        /// Broker-assigned delivery tag
        delivery_tag: u64,
        /// The reason for failure
        reason: String,
    },

    /// Network or transport error on an open session
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// A message ready to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Encoded body.
    pub payload: Vec<u8>,
    /// MIME type of the body.
    pub content_type: String,
    /// Survive broker restarts (delivery mode 2).
    pub persistent: bool,
}

impl OutgoingMessage {
    /// Persistent message with the given body and content type.
    #[must_use]
    pub fn persistent(payload: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            content_type: content_type.into(),
            persistent: true,
        }
    }
}

/// Settles a single delivery with the broker.
///
/// Implemented by each broker backend; consumers use it through [`Delivery`].
pub trait Acknowledger: Send + Sync {
    /// Confirm the message was processed; the broker forgets it.
    fn ack(&self) -> BrokerFuture<'_, ()>;

    /// Reject the message without requeueing it.
    fn nack(&self) -> BrokerFuture<'_, ()>;
}

/// A message received from a queue, owned until it is settled.
pub struct Delivery {
    /// Queue the message was consumed from.
    pub queue: String,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Broker-assigned tag, unique per channel.
    pub delivery_tag: u64,
    /// Raw message body.
    pub payload: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Wrap a received message and the handle used to settle it.
    #[must_use]
    pub fn new(
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        delivery_tag: u64,
        payload: Vec<u8>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            queue: queue.into(),
            routing_key: routing_key.into(),
            delivery_tag,
            payload,
            acker,
        }
    }

    /// Acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AckFailed`] if the channel rejected the ack.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Negatively acknowledge the delivery without requeue.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AckFailed`] if the channel rejected the nack.
    pub async fn nack(self) -> Result<(), BrokerError> {
        self.acker.nack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("routing_key", &self.routing_key)
            .field("delivery_tag", &self.delivery_tag)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from one or more queues, in arrival order.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Trait for message broker sessions.
///
/// All declarations are idempotent: declaring an existing durable queue or binding
/// again is a no-op.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so publishers and consumers can share an `Arc<dyn MessageBroker>`.
pub trait MessageBroker: Send + Sync {
    /// Declare a durable topic exchange.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::DeclareFailed`] if the broker refuses the declaration.
    fn declare_exchange(&self, exchange: &str) -> BrokerFuture<'_, ()>;

    /// Declare a durable queue.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::DeclareFailed`] if the broker refuses the declaration.
    fn declare_queue(&self, queue: &str) -> BrokerFuture<'_, ()>;

    /// Bind `queue` to `exchange` under `routing_key`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::BindFailed`] if the binding cannot be created.
    fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerFuture<'_, ()>;

    /// Publish a message to `exchange` under `routing_key`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] if the broker did not accept the message.
    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutgoingMessage,
    ) -> BrokerFuture<'_, ()>;

    /// Start consuming from `queues` with manual acknowledgement.
    ///
    /// The stream yields one delivery at a time; the next one is only requested once
    /// the previous has been settled (prefetch of one).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConsumeFailed`] if any queue cannot be consumed.
    fn consume(&self, queues: &[&str]) -> BrokerFuture<'_, DeliveryStream>;
}

/// Opens broker sessions from connection parameters.
///
/// The connection manager retries [`connect`](Connector::connect) until it succeeds
/// or its retry budget is spent.
pub trait Connector: Send + Sync {
    /// Session type produced by this connector.
    type Broker: MessageBroker + 'static;

    /// Open one connection and channel.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the broker cannot be reached.
    fn connect<'a>(&'a self, config: &'a BrokerConfig) -> BrokerFuture<'a, Self::Broker>;
}
