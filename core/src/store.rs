//! Relational mirror of a user and the store trait that owns it.
//!
//! The [`UserStore`] is the only component allowed to mutate user records. Every
//! method runs its existence check and writes inside one transaction, so a call either
//! commits completely or leaves the store untouched.
//!
//! | Call                        | Record exists            | Record missing               |
//! |-----------------------------|--------------------------|------------------------------|
//! | [`UserStore::create_user`]  | `AlreadyExists` (no-op)  | insert record + metadata     |
//! | [`UserStore::update_user`]  | sparse patch, restamp    | [`StoreError::NotFound`]     |
//! | [`UserStore::delete_user`]  | delete metadata, record  | `NotFound` outcome (no-op)   |

use crate::event::{Action, BusinessInfo};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Metadata key holding the upstream user identifier.
pub const META_SOURCE_USER_ID: &str = "source_user_id";
/// Metadata key mirroring `time_of_action`.
pub const META_TIME_OF_ACTION: &str = "time_of_action";
/// Metadata key mirroring `action_type`.
pub const META_ACTION_TYPE: &str = "action_type";

/// Errors raised by a [`UserStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// An UPDATE targeted an email with no record.
    #[error("No user found with email: {email}")]
    NotFound {
        /// The email that was looked up
        email: String,
    },

    /// A constraint rejected the write (duplicate login, bad foreign key, ...).
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Connection, query or transaction failure.
    #[error("Database error: {0}")]
    Database(String),
}

/// Stored business fields. Missing values are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusinessRecord {
    /// Registered business name.
    pub business_name: String,
    /// Business contact email.
    pub business_email: String,
    /// Physical address.
    pub real_address: String,
    /// VAT number.
    pub vat_number: String,
    /// Billing address.
    pub billing_address: String,
}

impl From<&BusinessInfo> for BusinessRecord {
    fn from(info: &BusinessInfo) -> Self {
        let field = |value: &Option<String>| value.clone().unwrap_or_default();
        Self {
            business_name: field(&info.business_name),
            business_email: field(&info.business_email),
            real_address: field(&info.real_address),
            vat_number: field(&info.vat_number),
            billing_address: field(&info.billing_address),
        }
    }
}

/// A user row as stored downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    /// Numeric primary key.
    pub id: i64,
    /// Login handle derived from the email local-part.
    pub login: String,
    /// URL-friendly name, same as the login.
    pub nicename: String,
    /// Unique email address.
    pub email: String,
    /// Pre-hashed credential, empty when none was supplied.
    pub credential: String,
    /// When the record was first mirrored.
    pub registered_at: DateTime<Utc>,
    /// Account status flag, `0` for active.
    pub status: i32,
    /// "First Last".
    pub display_name: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Phone number.
    pub phone_number: String,
    /// Business fields.
    pub business: BusinessRecord,
    /// Time of the last applied lifecycle action.
    pub time_of_action: DateTime<Utc>,
    /// Kind of the last applied lifecycle action.
    pub action_type: Action,
}

/// Everything needed to insert a user on CREATE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    /// Upstream identifier, stored as metadata.
    pub source_user_id: String,
    /// Login handle.
    pub login: String,
    /// Unique email address.
    pub email: String,
    /// Pre-hashed credential or empty.
    pub credential: String,
    /// "First Last".
    pub display_name: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Phone number.
    pub phone_number: String,
    /// Business fields, empty when the event had none.
    pub business: BusinessRecord,
    /// Time of the CREATE action.
    pub time_of_action: DateTime<Utc>,
    /// Time the record is written.
    pub registered_at: DateTime<Utc>,
}

impl NewUser {
    /// Build the row a [`UserStore`] inserts for this user.
    #[must_use]
    pub fn into_record(self, id: i64) -> UserRecord {
        UserRecord {
            id,
            nicename: self.login.clone(),
            login: self.login,
            email: self.email,
            credential: self.credential,
            registered_at: self.registered_at,
            status: 0,
            display_name: self.display_name,
            first_name: self.first_name,
            last_name: self.last_name,
            phone_number: self.phone_number,
            business: self.business,
            time_of_action: self.time_of_action,
            action_type: Action::Create,
        }
    }
}

/// Business fields carried by an UPDATE. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusinessPatch {
    /// New business name.
    pub business_name: Option<String>,
    /// New business email.
    pub business_email: Option<String>,
    /// New physical address.
    pub real_address: Option<String>,
    /// New VAT number.
    pub vat_number: Option<String>,
    /// New billing address.
    pub billing_address: Option<String>,
}

/// A sparse UPDATE. `None` fields keep their stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPatch {
    /// Email of the record to patch.
    pub email: String,
    /// New credential.
    pub credential: Option<String>,
    /// New given name.
    pub first_name: Option<String>,
    /// New family name.
    pub last_name: Option<String>,
    /// New phone number.
    pub phone_number: Option<String>,
    /// Business changes, only when the event carried a business group.
    pub business: Option<BusinessPatch>,
    /// Stamp for `time_of_action`.
    pub time_of_action: DateTime<Utc>,
}

impl UserPatch {
    /// Merge the patch into a stored record.
    ///
    /// Present fields overwrite, absent fields are preserved. The display name is
    /// rebuilt from the merged names and the lifecycle stamp is always refreshed.
    pub fn apply_to(&self, record: &mut UserRecord) {
        fn merge(target: &mut String, value: Option<&String>) {
            if let Some(value) = value {
                target.clone_from(value);
            }
        }

        merge(&mut record.credential, self.credential.as_ref());
        merge(&mut record.first_name, self.first_name.as_ref());
        merge(&mut record.last_name, self.last_name.as_ref());
        merge(&mut record.phone_number, self.phone_number.as_ref());

        if let Some(business) = &self.business {
            let stored = &mut record.business;
            merge(&mut stored.business_name, business.business_name.as_ref());
            merge(&mut stored.business_email, business.business_email.as_ref());
            merge(&mut stored.real_address, business.real_address.as_ref());
            merge(&mut stored.vat_number, business.vat_number.as_ref());
            merge(&mut stored.billing_address, business.billing_address.as_ref());
        }

        record.display_name = display_name(&record.first_name, &record.last_name);
        record.time_of_action = self.time_of_action;
        record.action_type = Action::Update;
    }
}

/// Result of applying one lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new record was inserted.
    Created {
        /// Primary key of the new record
        id: i64,
    },
    /// CREATE for an email that is already mirrored; nothing changed.
    AlreadyExists {
        /// Primary key of the existing record
        id: i64,
    },
    /// The record was patched.
    Updated {
        /// Primary key of the patched record
        id: i64,
    },
    /// The record and its metadata were removed.
    Deleted {
        /// Primary key of the removed record
        id: i64,
        /// Number of metadata rows removed with it
        metadata_rows: u64,
    },
    /// DELETE for an email that is not mirrored; nothing changed.
    NotFound,
}

impl ApplyOutcome {
    /// Short label for logs and metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::AlreadyExists { .. } => "already_exists",
            Self::Updated { .. } => "updated",
            Self::Deleted { .. } => "deleted",
            Self::NotFound => "not_found",
        }
    }
}

/// Storage for mirrored users.
///
/// # Dyn Compatibility
///
/// Methods return [`StoreFuture`] so consumers can hold an `Arc<dyn UserStore>`.
pub trait UserStore: Send + Sync {
    /// Look up a record by email.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    fn find_by_email<'a>(&'a self, email: &'a str) -> StoreFuture<'a, Option<UserRecord>>;

    /// Insert a user unless one with the same email exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Constraint`] or [`StoreError::Database`]; the
    /// transaction is rolled back.
    fn create_user<'a>(&'a self, user: &'a NewUser) -> StoreFuture<'a, ApplyOutcome>;

    /// Apply a sparse patch to the user with `patch.email`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such user exists, or a database error;
    /// the transaction is rolled back.
    fn update_user<'a>(&'a self, patch: &'a UserPatch) -> StoreFuture<'a, ApplyOutcome>;

    /// Delete the user with `email` and its metadata. Missing users are a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`]; the transaction is rolled back.
    fn delete_user<'a>(&'a self, email: &'a str) -> StoreFuture<'a, ApplyOutcome>;
}

/// "First Last", without stray spaces when a part is empty.
#[must_use]
pub fn display_name(first_name: &str, last_name: &str) -> String {
    format!("{} {}", first_name.trim(), last_name.trim())
        .trim()
        .to_string()
}

/// Login handle for an email: its local-part, or the whole address if it has none.
#[must_use]
pub fn login_from_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, _)) if !local.is_empty() => local.to_string(),
        _ => email.to_string(),
    }
}
