//! Fan-out publishing of lifecycle events.
//!
//! One [`Publisher::publish`] call encodes the event once and delivers it to every
//! destination:
//!
//! ```text
//! declare exchange (durable topic)
//!   └─ for each destination, independently:
//!        declare queue → bind queue → publish (persistent, text/xml)
//! ```
//!
//! A failing destination does not stop the others. The [`PublishReport`] names which
//! destinations received the event. Retrying is left to the caller.

use crate::metrics::PublisherMetrics;
use std::sync::Arc;
use user_sync_core::broker::{BrokerError, MessageBroker, OutgoingMessage};
use user_sync_core::codec::{CONTENT_TYPE, XmlCodec};
use user_sync_core::error::SyncError;
use user_sync_core::event::UserLifecycleEvent;
use user_sync_core::routing::{Destination, Destinations};

/// Per-destination result of a fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Destinations that accepted the event, in publish order.
    pub delivered: Vec<Destination>,
    /// Destinations that did not, with the error that stopped them.
    pub failed: Vec<(Destination, BrokerError)>,
}

impl PublishReport {
    /// True if every destination received the event.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Number of destinations attempted.
    #[must_use]
    pub fn total(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }

    /// Convert into the delivered destinations, or an error if any failed.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::PartialPublish`] if at least one destination failed.
    pub fn into_result(self) -> Result<Vec<Destination>, SyncError> {
        if self.is_complete() {
            Ok(self.delivered)
        } else {
            Err(SyncError::PartialPublish {
                failed: self.failed.len(),
                total: self.total(),
            })
        }
    }
}

/// Publishes lifecycle events to a shared exchange.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn MessageBroker>,
    exchange: String,
    codec: XmlCodec,
}

impl Publisher {
    /// Publisher over `broker` targeting `exchange`.
    #[must_use]
    pub fn new(broker: Arc<dyn MessageBroker>, exchange: impl Into<String>) -> Self {
        Self {
            broker,
            exchange: exchange.into(),
            codec: XmlCodec::new(),
        }
    }

    /// Replace the codec.
    #[must_use]
    pub const fn with_codec(mut self, codec: XmlCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Exchange events are published to.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Fan `event` out to every destination.
    ///
    /// Never fails as a whole; inspect the report or call
    /// [`PublishReport::into_result`].
    pub async fn publish(
        &self,
        event: &UserLifecycleEvent,
        destinations: &Destinations,
    ) -> PublishReport {
        let mut report = PublishReport::default();

        if let Err(error) = self.broker.declare_exchange(&self.exchange).await {
            tracing::error!(
                exchange = %self.exchange,
                error = %error,
                "Failed to declare exchange, no destination attempted"
            );
            for destination in destinations {
                PublisherMetrics::record_publish(&destination.routing_key, false);
                report.failed.push((destination.clone(), error.clone()));
            }
            return report;
        }

        let message = OutgoingMessage::persistent(self.codec.encode(event), CONTENT_TYPE);

        for destination in destinations {
            match self.publish_one(destination, &message).await {
                Ok(()) => {
                    tracing::debug!(
                        queue = %destination.queue,
                        routing_key = %destination.routing_key,
                        action = %event.action,
                        "Event published"
                    );
                    PublisherMetrics::record_publish(&destination.routing_key, true);
                    report.delivered.push(destination.clone());
                },
                Err(error) => {
                    tracing::error!(
                        queue = %destination.queue,
                        routing_key = %destination.routing_key,
                        action = %event.action,
                        error = %error,
                        "Failed to publish event"
                    );
                    PublisherMetrics::record_publish(&destination.routing_key, false);
                    report.failed.push((destination.clone(), error));
                },
            }
        }

        tracing::info!(
            action = %event.action,
            email = event.email().unwrap_or_default(),
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Fan-out finished"
        );
        report
    }

    async fn publish_one(
        &self,
        destination: &Destination,
        message: &OutgoingMessage,
    ) -> Result<(), BrokerError> {
        self.broker.declare_queue(&destination.queue).await?;
        self.broker
            .bind_queue(&destination.queue, &self.exchange, &destination.routing_key)
            .await?;
        self.broker
            .publish(&self.exchange, &destination.routing_key, message)
            .await
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("exchange", &self.exchange)
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}
