//! In-memory user store.
//!
//! Mirrors the relational layout (users plus a keyed metadata table) closely enough
//! to check idempotence and sparse-update behavior without a database. Every call
//! works on the locked state and validates before it mutates, so a failing call
//! leaves nothing behind.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use user_sync_core::event::Action;
use user_sync_core::store::{
    ApplyOutcome, META_ACTION_TYPE, META_SOURCE_USER_ID, META_TIME_OF_ACTION, NewUser,
    StoreError, StoreFuture, UserPatch, UserRecord, UserStore,
};

#[derive(Debug, Default)]
struct StoreState {
    users: BTreeMap<i64, UserRecord>,
    meta: BTreeMap<(i64, String), String>,
    next_id: i64,
    writes: usize,
    fail_next: Option<StoreError>,
}

impl StoreState {
    fn id_for(&self, email: &str) -> Option<i64> {
        self.users
            .values()
            .find(|user| user.email == email)
            .map(|user| user.id)
    }

    fn set_meta(&mut self, id: i64, key: &str, value: String) {
        self.meta.insert((id, key.to_string()), value);
    }
}

/// In-memory [`UserStore`]. Clones share state.
///
/// # Example
///
/// ```
/// use user_sync_testing::InMemoryUserStore;
///
/// let store = InMemoryUserStore::new();
/// assert!(store.is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryUserStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryUserStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next mutating call fail with `error` without touching state.
    pub fn fail_next(&self, error: StoreError) {
        self.lock().fail_next = Some(error);
    }

    /// Number of stored users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().users.len()
    }

    /// True if no users are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().users.is_empty()
    }

    /// The user with `email`, if any.
    #[must_use]
    pub fn user(&self, email: &str) -> Option<UserRecord> {
        let state = self.lock();
        state.id_for(email).and_then(|id| state.users.get(&id).cloned())
    }

    /// Metadata rows of user `id`, keyed by meta key.
    #[must_use]
    pub fn metadata(&self, id: i64) -> BTreeMap<String, String> {
        self.lock()
            .meta
            .iter()
            .filter(|((user_id, _), _)| *user_id == id)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Total metadata rows across all users.
    #[must_use]
    pub fn metadata_len(&self) -> usize {
        self.lock().meta.len()
    }

    /// Number of committed mutations (inserts, updates, deletes).
    #[must_use]
    pub fn writes(&self) -> usize {
        self.lock().writes
    }
}

impl UserStore for InMemoryUserStore {
    fn find_by_email<'a>(&'a self, email: &'a str) -> StoreFuture<'a, Option<UserRecord>> {
        Box::pin(async move { Ok(self.user(email)) })
    }

    fn create_user<'a>(&'a self, user: &'a NewUser) -> StoreFuture<'a, ApplyOutcome> {
        Box::pin(async move {
            let mut state = self.lock();
            if let Some(error) = state.fail_next.take() {
                return Err(error);
            }
            if let Some(id) = state.id_for(&user.email) {
                return Ok(ApplyOutcome::AlreadyExists { id });
            }

            state.next_id += 1;
            let id = state.next_id;
            let record = user.clone().into_record(id);
            state.set_meta(id, META_SOURCE_USER_ID, user.source_user_id.clone());
            state.set_meta(id, META_TIME_OF_ACTION, record.time_of_action.to_rfc3339());
            state.set_meta(id, META_ACTION_TYPE, Action::Create.to_string());
            state.users.insert(id, record);
            state.writes += 1;
            Ok(ApplyOutcome::Created { id })
        })
    }

    fn update_user<'a>(&'a self, patch: &'a UserPatch) -> StoreFuture<'a, ApplyOutcome> {
        Box::pin(async move {
            let mut state = self.lock();
            if let Some(error) = state.fail_next.take() {
                return Err(error);
            }
            let Some(id) = state.id_for(&patch.email) else {
                return Err(StoreError::NotFound {
                    email: patch.email.clone(),
                });
            };

            let time_of_action = if let Some(record) = state.users.get_mut(&id) {
                patch.apply_to(record);
                record.time_of_action
            } else {
                return Err(StoreError::NotFound {
                    email: patch.email.clone(),
                });
            };
            state.set_meta(id, META_TIME_OF_ACTION, time_of_action.to_rfc3339());
            state.set_meta(id, META_ACTION_TYPE, Action::Update.to_string());
            state.writes += 1;
            Ok(ApplyOutcome::Updated { id })
        })
    }

    fn delete_user<'a>(&'a self, email: &'a str) -> StoreFuture<'a, ApplyOutcome> {
        Box::pin(async move {
            let mut state = self.lock();
            if let Some(error) = state.fail_next.take() {
                return Err(error);
            }
            let Some(id) = state.id_for(email) else {
                return Ok(ApplyOutcome::NotFound);
            };

            let before = state.meta.len();
            state.meta.retain(|(user_id, _), _| *user_id != id);
            let metadata_rows = u64::try_from(before - state.meta.len()).unwrap_or(u64::MAX);
            state.users.remove(&id);
            state.writes += 1;
            Ok(ApplyOutcome::Deleted { id, metadata_rows })
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code: failures surface as assertion panics
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::test_clock;
    use user_sync_core::apply::{plan_create, plan_update};

    #[tokio::test]
    async fn create_is_idempotent_by_email() {
        let store = InMemoryUserStore::new();
        let user = plan_create(&fixtures::alice_create(), &test_clock()).unwrap();

        let first = store.create_user(&user).await.unwrap();
        let second = store.create_user(&user).await.unwrap();

        assert!(matches!(first, ApplyOutcome::Created { .. }));
        assert!(matches!(second, ApplyOutcome::AlreadyExists { .. }));
        assert_eq!(store.len(), 1);
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn login_is_not_unique_across_email_domains() {
        let store = InMemoryUserStore::new();
        let first = plan_create(
            &fixtures::alice_create().with_email("alice@a.example"),
            &test_clock(),
        )
        .unwrap();
        let second = plan_create(
            &fixtures::alice_create().with_email("alice@b.example"),
            &test_clock(),
        )
        .unwrap();
        assert_eq!(first.login, second.login);

        assert!(matches!(store.create_user(&first).await.unwrap(), ApplyOutcome::Created { .. }));
        assert!(matches!(store.create_user(&second).await.unwrap(), ApplyOutcome::Created { .. }));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn update_of_missing_user_is_not_found() {
        let store = InMemoryUserStore::new();
        let patch = plan_update(&fixtures::alice_update_phone("555"), &test_clock()).unwrap();

        let err = store.update_user(&patch).await.unwrap_err();

        assert_eq!(
            err,
            StoreError::NotFound {
                email: fixtures::ALICE_EMAIL.to_string()
            }
        );
    }

    #[tokio::test]
    async fn injected_failure_leaves_state_untouched() {
        let store = InMemoryUserStore::new();
        let user = plan_create(&fixtures::alice_create(), &test_clock()).unwrap();
        store.fail_next(StoreError::Database("connection reset".to_string()));

        assert!(store.create_user(&user).await.is_err());
        assert!(store.is_empty());
        assert_eq!(store.metadata_len(), 0);

        assert!(store.create_user(&user).await.is_ok());
    }

    #[tokio::test]
    async fn delete_reports_removed_metadata() {
        let store = InMemoryUserStore::new();
        let user = plan_create(&fixtures::alice_create(), &test_clock()).unwrap();
        store.create_user(&user).await.unwrap();

        let outcome = store.delete_user(fixtures::ALICE_EMAIL).await.unwrap();

        assert!(matches!(outcome, ApplyOutcome::Deleted { metadata_rows: 3, .. }));
        assert_eq!(store.metadata_len(), 0);
        assert_eq!(
            store.delete_user(fixtures::ALICE_EMAIL).await.unwrap(),
            ApplyOutcome::NotFound
        );
    }
}
