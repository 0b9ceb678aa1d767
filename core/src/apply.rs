//! Translation of validated lifecycle events into store calls.
//!
//! Planning is pure: [`plan_create`] and [`plan_update`] only read the event and the
//! clock. [`apply_event`] dispatches the plan to a [`UserStore`], which owns the
//! transaction.

use crate::environment::Clock;
use crate::event::{Action, MissingField, UserLifecycleEvent};
use crate::store::{
    ApplyOutcome, BusinessPatch, BusinessRecord, NewUser, StoreError, UserPatch, UserStore,
    display_name, login_from_email,
};
use chrono::{DateTime, NaiveDateTime, Utc};

/// Parse an upstream action timestamp.
///
/// Accepts RFC 3339 and the naive `YYYY-MM-DD HH:MM:SS` / `YYYY-MM-DDTHH:MM:SS`
/// forms, the latter read as UTC.
#[must_use]
pub fn parse_action_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

/// Derive the record a CREATE inserts.
///
/// Missing optional fields are stored as empty strings. `time_of_action` is the
/// event's own timestamp, or the clock when it cannot be parsed.
///
/// # Errors
///
/// Returns [`MissingField`] if the event has no email.
pub fn plan_create(event: &UserLifecycleEvent, clock: &dyn Clock) -> Result<NewUser, MissingField> {
    let email = required_email(event)?;
    let now = clock.now();
    let text = |value: &Option<String>| value.clone().unwrap_or_default();

    let first_name = text(&event.first_name);
    let last_name = text(&event.last_name);

    Ok(NewUser {
        source_user_id: event.user_id.clone(),
        login: login_from_email(email),
        email: email.to_string(),
        credential: text(&event.credential),
        display_name: display_name(&first_name, &last_name),
        first_name,
        last_name,
        phone_number: text(&event.phone_number),
        business: event
            .business
            .as_ref()
            .map(BusinessRecord::from)
            .unwrap_or_default(),
        time_of_action: parse_action_time(&event.action_time).unwrap_or(now),
        registered_at: now,
    })
}

/// Derive the sparse patch an UPDATE applies.
///
/// Blank incoming values count as absent, so they never wipe stored data.
///
/// # Errors
///
/// Returns [`MissingField`] if the event has no email.
pub fn plan_update(event: &UserLifecycleEvent, clock: &dyn Clock) -> Result<UserPatch, MissingField> {
    let email = required_email(event)?;

    Ok(UserPatch {
        email: email.to_string(),
        credential: present(event.credential.as_ref()),
        first_name: present(event.first_name.as_ref()),
        last_name: present(event.last_name.as_ref()),
        phone_number: present(event.phone_number.as_ref()),
        business: event.business.as_ref().map(|business| BusinessPatch {
            business_name: present(business.business_name.as_ref()),
            business_email: present(business.business_email.as_ref()),
            real_address: present(business.real_address.as_ref()),
            vat_number: present(business.vat_number.as_ref()),
            billing_address: present(business.billing_address.as_ref()),
        }),
        time_of_action: clock.now(),
    })
}

/// Error from [`apply_event`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// The event cannot be planned.
    #[error(transparent)]
    Invalid(#[from] MissingField),

    /// The store rejected the operation; nothing was committed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Apply one event to the store, dispatching on its action.
///
/// # Errors
///
/// Returns [`ApplyError::Invalid`] for events without an email and
/// [`ApplyError::Store`] when the store call fails.
pub async fn apply_event(
    store: &dyn UserStore,
    event: &UserLifecycleEvent,
    clock: &dyn Clock,
) -> Result<ApplyOutcome, ApplyError> {
    let outcome = match event.action {
        Action::Create => {
            let user = plan_create(event, clock)?;
            store.create_user(&user).await?
        },
        Action::Update => {
            let patch = plan_update(event, clock)?;
            store.update_user(&patch).await?
        },
        Action::Delete => {
            let email = required_email(event)?;
            store.delete_user(email).await?
        },
    };
    Ok(outcome)
}

fn required_email(event: &UserLifecycleEvent) -> Result<&str, MissingField> {
    event.email().ok_or(MissingField {
        action: event.action,
        field: "email",
    })
}

fn present(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty()).cloned()
}
