//! Bounded-retry broker connection.
//!
//! [`ConnectionManager::connect`] is called once per process at startup. It tries the
//! [`Connector`] until it succeeds or the [`RetryPolicy`] is spent, then hands the session
//! to the publisher or consumer for the rest of the process lifetime.
//!
//! A session that drops later is not re-established here: the consumer surfaces the
//! error and the process exits, leaving restarts to the supervisor.

use crate::metrics::ConnectionMetrics;
use crate::retry::{RetryExhausted, RetryPolicy, retry_with_backoff};
use user_sync_core::broker::Connector;
use user_sync_core::config::BrokerConfig;
use user_sync_core::error::SyncError;

/// Opens broker sessions with bounded retry.
#[derive(Debug)]
pub struct ConnectionManager<C> {
    connector: C,
    config: BrokerConfig,
    policy: RetryPolicy,
}

impl<C: Connector> ConnectionManager<C> {
    /// Manager using the default policy (10 attempts, 5 seconds apart).
    #[must_use]
    pub fn new(connector: C, config: BrokerConfig) -> Self {
        Self {
            connector,
            config,
            policy: RetryPolicy::default(),
        }
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The active retry policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Connect, retrying per the policy.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::BrokerUnavailable`] with the last connection error once
    /// every attempt has failed. Callers treat this as fatal.
    pub async fn connect(&self) -> Result<C::Broker, SyncError> {
        tracing::info!(
            host = %self.config.host,
            port = self.config.port,
            vhost = %self.config.vhost,
            max_attempts = self.policy.max_attempts,
            "Connecting to broker"
        );

        let result = retry_with_backoff(&self.policy, || async {
            let attempt = self.connector.connect(&self.config).await;
            ConnectionMetrics::record_attempt(attempt.is_ok());
            attempt
        })
        .await;

        match result {
            Ok(broker) => {
                tracing::info!(host = %self.config.host, "Connected to broker");
                Ok(broker)
            },
            Err(RetryExhausted {
                attempts,
                last_error,
            }) => Err(SyncError::BrokerUnavailable {
                attempts,
                reason: last_error.to_string(),
            }),
        }
    }
}
