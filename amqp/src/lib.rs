//! AMQP 0-9-1 broker implementation for user synchronization.
//!
//! This crate provides [`AmqpBroker`], which implements the [`MessageBroker`] trait from
//! `user-sync-core` on top of lapin, and [`AmqpConnector`], which the connection
//! manager uses to open sessions.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual acknowledgement:
//! - Every publish waits for the broker's publisher confirm
//! - Messages are published persistent to durable queues
//! - Consumers receive one unacknowledged delivery at a time (prefetch 1)
//! - A nack never requeues; unacknowledged deliveries are redelivered after a
//!   disconnect
//! - A consumer cancelled by the broker surfaces as a transport error on the
//!   delivery stream
//!
//! # Example
//!
//! ```no_run
//! use user_sync_amqp::AmqpConnector;
//! use user_sync_core::broker::{Connector, MessageBroker, OutgoingMessage};
//! use user_sync_core::config::BrokerConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BrokerConfig::default();
//! let broker = AmqpConnector::new().connect(&config).await?;
//!
//! broker.declare_exchange("user").await?;
//! broker.declare_queue("crm_user_create").await?;
//! broker.bind_queue("crm_user_create", "user", "crm.user.create").await?;
//! broker
//!     .publish("user", "crm.user.create", &OutgoingMessage::persistent("<UserMessage/>", "text/xml"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use futures::{Stream, StreamExt};
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::fmt;
use std::sync::Arc;
use user_sync_core::broker::{
    Acknowledger, BrokerError, BrokerFuture, Connector, Delivery, DeliveryStream, MessageBroker,
    OutgoingMessage,
};
use user_sync_core::config::BrokerConfig;

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Reply code sent when closing channels and connections normally.
const REPLY_SUCCESS: u16 = 200;

/// Opens [`AmqpBroker`] sessions.
///
/// Each session is one connection with one channel in confirm mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmqpConnector {
    prefetch: u16,
}

impl AmqpConnector {
    /// Connector with a prefetch of one unacknowledged delivery.
    #[must_use]
    pub const fn new() -> Self {
        Self { prefetch: 1 }
    }

    /// Override the per-channel prefetch count.
    #[must_use]
    pub const fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// The configured prefetch count.
    #[must_use]
    pub const fn prefetch(&self) -> u16 {
        self.prefetch
    }
}

impl Default for AmqpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for AmqpConnector {
    type Broker = AmqpBroker;

    fn connect<'a>(&'a self, config: &'a BrokerConfig) -> BrokerFuture<'a, AmqpBroker> {
        let prefetch = self.prefetch;

        Box::pin(async move {
            let endpoint = format!("{}:{}{}", config.host, config.port, config.vhost);

            let connection = Connection::connect(&config.amqp_uri(), ConnectionProperties::default())
                .await
                .map_err(|e| BrokerError::ConnectionFailed(format!("{endpoint}: {e}")))?;

            let channel = connection.create_channel().await.map_err(|e| {
                BrokerError::ConnectionFailed(format!("Failed to open channel on {endpoint}: {e}"))
            })?;

            channel
                .basic_qos(prefetch, BasicQosOptions { global: true })
                .await
                .map_err(|e| {
                    BrokerError::ConnectionFailed(format!("Failed to set prefetch on {endpoint}: {e}"))
                })?;

            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| {
                    BrokerError::ConnectionFailed(format!(
                        "Failed to enable publisher confirms on {endpoint}: {e}"
                    ))
                })?;

            tracing::info!(
                endpoint = %endpoint,
                username = %config.username,
                prefetch = prefetch,
                "AMQP session opened"
            );

            Ok(AmqpBroker {
                connection: Arc::new(connection),
                channel,
            })
        })
    }
}

/// AMQP broker session.
///
/// Owns the connection and its channel; dropping the last clone closes the
/// connection without a graceful handshake, so prefer [`AmqpBroker::close`].
#[derive(Clone)]
pub struct AmqpBroker {
    connection: Arc<Connection>,
    channel: Channel,
}

impl AmqpBroker {
    /// Whether the underlying connection is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    /// Close the channel, then the connection.
    ///
    /// Unacknowledged deliveries are returned to their queues by the broker.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::TransportError`] if either close handshake fails.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.channel
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|e| BrokerError::TransportError(format!("Failed to close channel: {e}")))?;
        self.connection
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|e| BrokerError::TransportError(format!("Failed to close connection: {e}")))?;

        tracing::info!("AMQP session closed");
        Ok(())
    }
}

impl fmt::Debug for AmqpBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpBroker")
            .field("channel_id", &self.channel.id())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl MessageBroker for AmqpBroker {
    fn declare_exchange(&self, exchange: &str) -> BrokerFuture<'_, ()> {
        let exchange = exchange.to_string();

        Box::pin(async move {
            self.channel
                .exchange_declare(
                    &exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::DeclareFailed {
                    name: exchange.clone(),
                    reason: e.to_string(),
                })?;

            tracing::debug!(exchange = %exchange, "Exchange declared");
            Ok(())
        })
    }

    fn declare_queue(&self, queue: &str) -> BrokerFuture<'_, ()> {
        let queue = queue.to_string();

        Box::pin(async move {
            self.channel
                .queue_declare(
                    &queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::DeclareFailed {
                    name: queue.clone(),
                    reason: e.to_string(),
                })?;

            tracing::debug!(queue = %queue, "Queue declared");
            Ok(())
        })
    }

    fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerFuture<'_, ()> {
        let queue = queue.to_string();
        let exchange = exchange.to_string();
        let routing_key = routing_key.to_string();

        Box::pin(async move {
            self.channel
                .queue_bind(
                    &queue,
                    &exchange,
                    &routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::BindFailed {
                    queue: queue.clone(),
                    routing_key: routing_key.clone(),
                    reason: e.to_string(),
                })?;

            tracing::debug!(queue = %queue, exchange = %exchange, routing_key = %routing_key, "Queue bound");
            Ok(())
        })
    }

    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutgoingMessage,
    ) -> BrokerFuture<'_, ()> {
        // Clone data before moving into async block
        let exchange = exchange.to_string();
        let routing_key = routing_key.to_string();
        let message = message.clone();

        Box::pin(async move {
            let mut properties =
                BasicProperties::default().with_content_type(message.content_type.clone().into());
            if message.persistent {
                properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
            }

            let publish_failed = |reason: String| BrokerError::PublishFailed {
                routing_key: routing_key.clone(),
                reason,
            };

            let confirm = self
                .channel
                .basic_publish(
                    &exchange,
                    &routing_key,
                    BasicPublishOptions::default(),
                    &message.payload,
                    properties,
                )
                .await
                .map_err(|e| publish_failed(e.to_string()))?;

            match confirm.await {
                Ok(confirmation) if confirmation.is_nack() => {
                    tracing::error!(
                        exchange = %exchange,
                        routing_key = %routing_key,
                        "Broker refused message"
                    );
                    Err(publish_failed("broker returned a negative confirm".to_string()))
                },
                Ok(_) => {
                    tracing::debug!(
                        exchange = %exchange,
                        routing_key = %routing_key,
                        bytes = message.payload.len(),
                        "Message published"
                    );
                    Ok(())
                },
                Err(e) => {
                    tracing::error!(
                        exchange = %exchange,
                        routing_key = %routing_key,
                        error = %e,
                        "Failed to publish message"
                    );
                    Err(publish_failed(e.to_string()))
                },
            }
        })
    }

    fn consume(&self, queues: &[&str]) -> BrokerFuture<'_, DeliveryStream> {
        let queues: Vec<String> = queues.iter().map(|q| (*q).to_string()).collect();

        Box::pin(async move {
            let mut consumers = Vec::with_capacity(queues.len());
            for queue in &queues {
                let consumer = self
                    .channel
                    .basic_consume(
                        queue,
                        &format!("user-sync-{queue}"),
                        BasicConsumeOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| BrokerError::ConsumeFailed {
                        queues: queues.clone(),
                        reason: e.to_string(),
                    })?;

                consumers.push(until_cancelled(queue.clone(), consumer));
            }

            tracing::info!(queues = ?queues, "Consuming");

            let mut merged = futures::stream::select_all(consumers);
            let stream = async_stream::stream! {
                while let Some(item) = merged.next().await {
                    match item {
                        Ok((queue, delivery)) => {
                            let routing_key = delivery.routing_key.as_str().to_string();
                            let acker = AmqpAcker {
                                acker: delivery.acker,
                                delivery_tag: delivery.delivery_tag,
                            };
                            yield Ok(Delivery::new(
                                queue,
                                routing_key,
                                delivery.delivery_tag,
                                delivery.data,
                                Box::new(acker),
                            ));
                        },
                        Err(e) => {
                            tracing::error!(error = %e, "Consumer stream failed");
                            yield Err(e);
                        },
                    }
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

/// Tag one queue's deliveries with the queue name.
///
/// A broker consumer only ends when the broker cancels it (queue deleted, node
/// failover). That end is reported as a transport error naming the queue.
fn until_cancelled<S, T, E>(
    queue: String,
    consumer: S,
) -> impl Stream<Item = Result<(String, T), BrokerError>> + Unpin + Send
where
    S: Stream<Item = Result<T, E>> + Unpin + Send,
    T: Send,
    E: fmt::Display,
{
    let cancelled = BrokerError::TransportError(format!("consumer for {queue} cancelled"));
    consumer
        .map(move |item| match item {
            Ok(value) => Ok((queue.clone(), value)),
            Err(e) => Err(BrokerError::TransportError(format!("{queue}: {e}"))),
        })
        .chain(futures::stream::once(futures::future::ready(Err(cancelled))))
}

/// Settles one lapin delivery.
struct AmqpAcker {
    acker: Acker,
    delivery_tag: u64,
}

impl Acknowledger for AmqpAcker {
    fn ack(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.acker
                .ack(BasicAckOptions::default())
                .await
                .map_err(|e| BrokerError::AckFailed {
                    delivery_tag: self.delivery_tag,
                    reason: e.to_string(),
                })
        })
    }

    fn nack(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.acker
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: false,
                })
                .await
                .map_err(|e| BrokerError::AckFailed {
                    delivery_tag: self.delivery_tag,
                    reason: e.to_string(),
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amqp_broker_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<AmqpBroker>();
        assert_sync::<AmqpBroker>();
        assert_send::<AmqpConnector>();
        assert_sync::<AmqpConnector>();
    }

    #[test]
    fn connector_defaults_to_prefetch_one() {
        assert_eq!(AmqpConnector::default().prefetch(), 1);
        assert_eq!(AmqpConnector::new().with_prefetch(10).prefetch(), 10);
    }

    #[tokio::test]
    async fn cancelled_queue_consumer_ends_with_transport_error() {
        let consumer = futures::stream::iter(vec![Ok::<_, String>(7_u64)]);

        let items: Vec<_> = until_cancelled("crm_user_create".to_string(), consumer)
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], Ok((queue, 7)) if queue == "crm_user_create"));
        assert!(matches!(
            &items[1],
            Err(BrokerError::TransportError(reason)) if reason == "consumer for crm_user_create cancelled"
        ));
    }

    #[tokio::test]
    async fn merged_consumers_report_each_cancellation() {
        let crm = until_cancelled(
            "crm_user_create".to_string(),
            futures::stream::iter(vec![Err::<u64, _>("channel closed".to_string())]),
        );
        let kassa = until_cancelled(
            "kassa_user_create".to_string(),
            futures::stream::iter(Vec::<Result<u64, String>>::new()),
        );

        let items: Vec<_> = futures::stream::select_all(vec![crm, kassa]).collect().await;

        assert_eq!(items.len(), 3);
        assert!(items.iter().all(Result::is_err));
        assert!(items.iter().any(|item| matches!(
            item,
            Err(BrokerError::TransportError(reason)) if reason == "crm_user_create: channel closed"
        )));
        assert!(items.iter().any(|item| matches!(
            item,
            Err(BrokerError::TransportError(reason)) if reason == "consumer for kassa_user_create cancelled"
        )));
    }

    #[tokio::test]
    async fn connect_to_unreachable_broker_fails() {
        let config = BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..BrokerConfig::default()
        };

        let result = AmqpConnector::new().connect(&config).await;

        assert!(matches!(result, Err(BrokerError::ConnectionFailed(reason)) if reason.contains("127.0.0.1:1")));
    }
}
