//! The user lifecycle event, the unit of synchronization.
//!
//! A [`UserLifecycleEvent`] describes one CREATE, UPDATE or DELETE of a user in the
//! upstream identity source. The [`Action`] is authoritative for dispatch and decides
//! which of the remaining fields are mandatory (see [`UserLifecycleEvent::validate`]).
//!
//! # Example
//!
//! ```
//! use user_sync_core::event::{Action, UserLifecycleEvent};
//!
//! let event = UserLifecycleEvent::new(Action::Delete, "42", "2025-01-01T00:00:00Z")
//!     .with_email("alice@example.com");
//!
//! assert!(event.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The lifecycle action carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    /// A new user was registered upstream.
    Create,
    /// An existing user changed one or more fields.
    Update,
    /// A user was removed upstream.
    Delete,
}

impl Action {
    /// Upper-case wire spelling (`CREATE`, `UPDATE`, `DELETE`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// Lower-case segment used in routing keys and queue names.
    #[must_use]
    pub const fn routing_segment(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when an action string is not one of `CREATE`, `UPDATE`, `DELETE`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown action `{0}`")]
pub struct UnknownAction(pub String);

impl FromStr for Action {
    type Err = UnknownAction;

    /// Parses case-insensitively, ignoring surrounding whitespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            _ => Err(UnknownAction(s.to_string())),
        }
    }
}

/// Optional business sub-record of a user.
///
/// The group is present or absent as a whole on the wire. Inside the group every
/// field is optional: on CREATE a missing field is stored as empty, on UPDATE a
/// missing field keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessInfo {
    /// Registered business name.
    pub business_name: Option<String>,
    /// Business contact email.
    pub business_email: Option<String>,
    /// Physical address of the business.
    pub real_address: Option<String>,
    /// VAT ("BTW") number.
    pub vat_number: Option<String>,
    /// Billing ("facturatie") address.
    pub billing_address: Option<String>,
}

/// A CREATE/UPDATE/DELETE notification about a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLifecycleEvent {
    /// Lifecycle action, authoritative for dispatch.
    pub action: Action,
    /// Upstream identifier, used as a correlation key only.
    pub user_id: String,
    /// Time of the originating action, ISO-8601 by convention.
    pub action_time: String,
    /// Pre-hashed credential material. Only meaningful on CREATE (and password changes).
    pub credential: Option<String>,
    /// Given name.
    pub first_name: Option<String>,
    /// Family name.
    pub last_name: Option<String>,
    /// Phone number.
    pub phone_number: Option<String>,
    /// Email address, the natural key of the relational record.
    pub email: Option<String>,
    /// Business sub-record, absent entirely when the user has none.
    pub business: Option<BusinessInfo>,
}

/// A decoded event that lacks a field its action requires.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{action} event is missing required field `{field}`")]
pub struct MissingField {
    /// Action of the offending event.
    pub action: Action,
    /// Name of the missing field.
    pub field: &'static str,
}

impl UserLifecycleEvent {
    /// Create an event with only the always-present envelope fields set.
    #[must_use]
    pub fn new(action: Action, user_id: impl Into<String>, action_time: impl Into<String>) -> Self {
        Self {
            action,
            user_id: user_id.into(),
            action_time: action_time.into(),
            credential: None,
            first_name: None,
            last_name: None,
            phone_number: None,
            email: None,
            business: None,
        }
    }

    /// Set the email address.
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Set first and last name.
    #[must_use]
    pub fn with_name(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.first_name = Some(first.into());
        self.last_name = Some(last.into());
        self
    }

    /// Set the phone number.
    #[must_use]
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone_number = Some(phone.into());
        self
    }

    /// Set the pre-hashed credential.
    #[must_use]
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Attach a business sub-record.
    #[must_use]
    pub fn with_business(mut self, business: BusinessInfo) -> Self {
        self.business = Some(business);
        self
    }

    /// Email address if present and non-blank.
    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref().map(str::trim).filter(|e| !e.is_empty())
    }

    /// Check the fields the event's action makes mandatory.
    ///
    /// Every action needs a non-empty `user_id`, `action_time` and `email`.
    ///
    /// # Errors
    ///
    /// Returns [`MissingField`] naming the first absent field.
    pub fn validate(&self) -> Result<(), MissingField> {
        let missing = |field| MissingField {
            action: self.action,
            field,
        };

        if self.user_id.trim().is_empty() {
            return Err(missing("user_id"));
        }
        if self.action_time.trim().is_empty() {
            return Err(missing("action_time"));
        }
        if self.email().is_none() {
            return Err(missing("email"));
        }
        Ok(())
    }
}
