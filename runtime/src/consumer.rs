//! Generic lifecycle-event consumer.
//!
//! One [`Consumer`] serves one action across every subsystem queue of that action. Each
//! delivery moves through a fixed sequence and ends in exactly one settlement:
//!
//! ```text
//! RECEIVED ─► DECODED ─► action matches? ─► VALIDATED ─► APPLIED ─► ack
//!    │            │            │ no              │            │
//!    │            │            └────► ack (skipped)           │
//!    └─ decode ───┴──────── invalid ─────────────┴── store ───┴─► nack (no requeue)
//!       failure                                      failure
//! ```
//!
//! Deliveries are handled one at a time: the next one is not pulled from the stream
//! until the current one is settled. Every failure is contained to its message; only a
//! broken session (stream error, failed ack) ends the loop.

use crate::metrics::ConsumerMetrics;
use futures::StreamExt;
use std::future::{Future, pending};
use std::sync::Arc;
use std::time::Instant;
use user_sync_core::apply::apply_event;
use user_sync_core::broker::{BrokerError, Delivery, MessageBroker};
use user_sync_core::codec::XmlCodec;
use user_sync_core::environment::{Clock, SystemClock};
use user_sync_core::error::SyncError;
use user_sync_core::event::Action;
use user_sync_core::routing::Destinations;
use user_sync_core::store::{ApplyOutcome, UserStore};

/// What a consumer serves: one action, on one exchange, from a set of queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    /// The only action this consumer applies.
    pub action: Action,
    /// Exchange the queues are bound to.
    pub exchange: String,
    /// Queues to declare, bind and consume.
    pub destinations: Destinations,
}

impl ConsumerSpec {
    /// Conventional spec: the `action` queue of every subsystem.
    #[must_use]
    pub fn for_action<S: AsRef<str>>(action: Action, exchange: impl Into<String>, subsystems: &[S]) -> Self {
        Self {
            action,
            exchange: exchange.into(),
            destinations: Destinations::for_action(action, subsystems),
        }
    }
}

/// Final state of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The event was applied (possibly as an idempotent no-op). Acked.
    Applied(ApplyOutcome),
    /// The event carries another action ([`SyncError::ActionMismatch`]). Acked,
    /// store untouched.
    Skipped(SyncError),
    /// Decoding, validation or apply failed. Nacked without requeue.
    Rejected(SyncError),
}

impl Disposition {
    /// True if the delivery is acknowledged, false if it is negatively acknowledged.
    #[must_use]
    pub const fn acknowledges(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }

    /// Metrics outcome: `applied`, or the [`SyncError::kind`] that stopped the event.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Applied(_) => "applied",
            Self::Skipped(error) | Self::Rejected(error) => error.kind(),
        }
    }
}

/// Counts of settled deliveries, returned when a run ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Deliveries applied and acked.
    pub applied: u64,
    /// Deliveries skipped and acked.
    pub skipped: u64,
    /// Deliveries nacked.
    pub rejected: u64,
}

impl ConsumerStats {
    fn record(&mut self, disposition: &Disposition) {
        match disposition {
            Disposition::Applied(_) => self.applied += 1,
            Disposition::Skipped(_) => self.skipped += 1,
            Disposition::Rejected(_) => self.rejected += 1,
        }
    }

    /// Total deliveries settled.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.applied + self.skipped + self.rejected
    }
}

/// Applies lifecycle events from broker queues to a user store.
pub struct Consumer {
    broker: Arc<dyn MessageBroker>,
    store: Arc<dyn UserStore>,
    clock: Arc<dyn Clock>,
    codec: XmlCodec,
    spec: ConsumerSpec,
}

impl Consumer {
    /// Consumer with the system clock and the current codec.
    #[must_use]
    pub fn new(broker: Arc<dyn MessageBroker>, store: Arc<dyn UserStore>, spec: ConsumerSpec) -> Self {
        Self {
            broker,
            store,
            clock: Arc::new(SystemClock),
            codec: XmlCodec::new(),
            spec,
        }
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the codec, e.g. to pin an older alias table.
    #[must_use]
    pub const fn with_codec(mut self, codec: XmlCodec) -> Self {
        self.codec = codec;
        self
    }

    /// What this consumer serves.
    #[must_use]
    pub const fn spec(&self) -> &ConsumerSpec {
        &self.spec
    }

    /// Declare the exchange and every queue, and bind each queue under its routing key.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Broker`] if any declaration or binding fails.
    pub async fn prepare(&self) -> Result<(), SyncError> {
        self.broker.declare_exchange(&self.spec.exchange).await?;
        for destination in &self.spec.destinations {
            self.broker.declare_queue(&destination.queue).await?;
            self.broker
                .bind_queue(&destination.queue, &self.spec.exchange, &destination.routing_key)
                .await?;
        }
        Ok(())
    }

    /// Consume until the delivery stream ends.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Broker`] if setup fails, the stream yields an error, or a
    /// delivery cannot be settled.
    pub async fn run(&self) -> Result<ConsumerStats, SyncError> {
        self.run_until(pending::<()>()).await
    }

    /// Consume until the delivery stream ends or `shutdown` resolves.
    ///
    /// Shutdown is only observed between deliveries; a delivery being handled is
    /// always settled first.
    ///
    /// # Errors
    ///
    /// Same as [`run`](Self::run).
    pub async fn run_until<F>(&self, shutdown: F) -> Result<ConsumerStats, SyncError>
    where
        F: Future<Output = ()> + Send,
    {
        self.prepare().await?;

        let queues = self.spec.destinations.queues();
        let mut stream = self.broker.consume(&queues).await?;
        let mut stats = ConsumerStats::default();

        tracing::info!(
            action = %self.spec.action,
            exchange = %self.spec.exchange,
            queues = ?queues,
            "Consumer started"
        );

        tokio::pin!(shutdown);

        loop {
            let next = tokio::select! {
                biased;
                () = &mut shutdown => {
                    tracing::info!(action = %self.spec.action, "Shutdown requested");
                    break;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let disposition = self.handle(delivery).await?;
                    stats.record(&disposition);
                },
                Some(Err(error)) => {
                    tracing::error!(action = %self.spec.action, error = %error, "Delivery stream failed");
                    return Err(error.into());
                },
                None => {
                    tracing::info!(action = %self.spec.action, "Delivery stream ended");
                    break;
                },
            }
        }

        tracing::info!(
            action = %self.spec.action,
            applied = stats.applied,
            skipped = stats.skipped,
            rejected = stats.rejected,
            "Consumer stopped"
        );
        Ok(stats)
    }

    /// Process one delivery and settle it with the broker.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AckFailed`] if the ack or nack is refused. The
    /// disposition is lost in that case; the broker will redeliver.
    pub async fn handle(&self, delivery: Delivery) -> Result<Disposition, BrokerError> {
        let queue = delivery.queue.clone();
        let disposition = self.process(&queue, &delivery.payload).await;

        if disposition.acknowledges() {
            delivery.ack().await?;
        } else {
            delivery.nack().await?;
        }

        ConsumerMetrics::record_message(&queue, disposition.label());
        Ok(disposition)
    }

    /// Decode, check and apply a payload received on `queue`, without settling it.
    pub async fn process(&self, queue: &str, payload: &[u8]) -> Disposition {
        let event = match self.codec.decode_bytes(payload) {
            Ok(event) => event,
            Err(error) => {
                tracing::error!(
                    queue = %queue,
                    error = %error,
                    payload = %String::from_utf8_lossy(payload),
                    "Discarding malformed event"
                );
                return Disposition::Rejected(error.into());
            },
        };

        if event.action != self.spec.action {
            tracing::debug!(
                queue = %queue,
                expected = %self.spec.action,
                received = %event.action,
                "Skipping event for another action"
            );
            return Disposition::Skipped(SyncError::ActionMismatch {
                expected: self.spec.action,
                received: event.action,
            });
        }

        if let Err(missing) = event.validate() {
            tracing::warn!(
                queue = %queue,
                user_id = %event.user_id,
                error = %missing,
                "Discarding invalid event"
            );
            return Disposition::Rejected(missing.into());
        }

        let started = Instant::now();
        let result = apply_event(self.store.as_ref(), &event, self.clock.as_ref()).await;
        ConsumerMetrics::record_apply(event.action.routing_segment(), started.elapsed());

        match result {
            Ok(outcome) => {
                tracing::info!(
                    queue = %queue,
                    action = %event.action,
                    user_id = %event.user_id,
                    email = event.email().unwrap_or_default(),
                    outcome = outcome.label(),
                    "Event applied"
                );
                Disposition::Applied(outcome)
            },
            Err(error) => {
                let error = SyncError::from(error);
                tracing::error!(
                    queue = %queue,
                    action = %event.action,
                    user_id = %event.user_id,
                    email = event.email().unwrap_or_default(),
                    error = %error,
                    "Failed to apply event"
                );
                Disposition::Rejected(error)
            },
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("spec", &self.spec)
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}
