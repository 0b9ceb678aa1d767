//! Cross-cutting error taxonomy.
//!
//! Layer errors ([`CodecError`], [`BrokerError`], [`StoreError`]) convert into
//! [`SyncError`], which is what the publisher, consumer and connection manager
//! report. Each variant maps to one settlement decision in the consumer:
//!
//! | Variant              | Consumer reaction                  |
//! |----------------------|------------------------------------|
//! | `BrokerUnavailable`  | fatal, the process exits           |
//! | `MalformedEvent`     | nack, raw payload logged           |
//! | `ActionMismatch`     | ack, skipped, store untouched      |
//! | `InvalidEvent`       | nack                               |
//! | `ApplyFailure`       | nack, transaction rolled back      |
//! | `Broker`             | session ends, the process restarts |

use crate::apply::ApplyError;
use crate::broker::BrokerError;
use crate::codec::CodecError;
use crate::event::{Action, MissingField};
use crate::store::StoreError;
use thiserror::Error;

/// Errors surfaced by the synchronization pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Connection establishment exhausted its retry budget.
    #[error("Broker unavailable after {attempts} attempts: {reason}")]
    BrokerUnavailable {
        /// Attempts made
        attempts: u32,
        /// Error from the last attempt
        reason: String,
    },

    /// The payload is not a recognizable lifecycle event.
    #[error("Malformed event: {0}")]
    MalformedEvent(#[from] CodecError),

    /// The event's action does not belong to this consumer.
    #[error("Action mismatch: expected {expected}, received {received}")]
    ActionMismatch {
        /// Action the consumer handles
        expected: Action,
        /// Action the event carried
        received: Action,
    },

    /// The event decoded but lacks a field its action requires.
    #[error("Invalid event: {0}")]
    InvalidEvent(#[from] MissingField),

    /// The store rejected the operation.
    #[error("Apply failure: {0}")]
    ApplyFailure(#[from] StoreError),

    /// Some fan-out destinations did not receive the event.
    #[error("Partial publish: {failed} of {total} destinations failed")]
    PartialPublish {
        /// Destinations that failed
        failed: usize,
        /// Destinations attempted
        total: usize,
    },

    /// Broker error on an open session.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

impl From<ApplyError> for SyncError {
    fn from(error: ApplyError) -> Self {
        match error {
            ApplyError::Invalid(missing) => Self::InvalidEvent(missing),
            ApplyError::Store(store) => Self::ApplyFailure(store),
        }
    }
}

impl SyncError {
    /// Stable short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::BrokerUnavailable { .. } => "broker_unavailable",
            Self::MalformedEvent(_) => "malformed_event",
            Self::ActionMismatch { .. } => "action_mismatch",
            Self::InvalidEvent(_) => "invalid_event",
            Self::ApplyFailure(_) => "apply_failure",
            Self::PartialPublish { .. } => "partial_publish",
            Self::Broker(_) => "broker",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_errors_map_to_taxonomy() {
        let missing = MissingField {
            action: Action::Update,
            field: "email",
        };
        let err: SyncError = ApplyError::Invalid(missing).into();
        assert_eq!(err.kind(), "invalid_event");

        let err: SyncError = ApplyError::Store(StoreError::NotFound {
            email: "bob@example.com".to_string(),
        })
        .into();
        assert_eq!(err.kind(), "apply_failure");
        assert!(err.to_string().contains("bob@example.com"));
    }

    #[test]
    fn action_mismatch_names_both_actions() {
        let err = SyncError::ActionMismatch {
            expected: Action::Create,
            received: Action::Delete,
        };
        assert_eq!(err.kind(), "action_mismatch");
        assert_eq!(
            err.to_string(),
            "Action mismatch: expected CREATE, received DELETE"
        );
    }
}
