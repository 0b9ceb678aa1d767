//! `PostgreSQL` implementation of [`UserStore`].
//!
//! Every operation runs in its own transaction. The transaction is committed only
//! after the last statement succeeds; any early return drops it, which rolls back.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use std::time::Instant;
use user_sync_core::config::DatabaseConfig;
use user_sync_core::event::Action;
use user_sync_core::store::{
    ApplyOutcome, BusinessRecord, META_ACTION_TYPE, META_SOURCE_USER_ID, META_TIME_OF_ACTION,
    NewUser, StoreError, StoreFuture, UserPatch, UserRecord, UserStore,
};

const USER_COLUMNS: &str = "id, user_login, user_nicename, user_email, user_pass, \
    user_registered, user_status, display_name, first_name, last_name, phone_number, \
    business_name, business_email, real_address, vat_number, billing_address, \
    time_of_action, action_type";

#[derive(Debug, FromRow)]
struct UserRow {
    id: i64,
    user_login: String,
    user_nicename: String,
    user_email: String,
    user_pass: String,
    user_registered: DateTime<Utc>,
    user_status: i32,
    display_name: String,
    first_name: String,
    last_name: String,
    phone_number: String,
    business_name: String,
    business_email: String,
    real_address: String,
    vat_number: String,
    billing_address: String,
    time_of_action: DateTime<Utc>,
    action_type: String,
}

impl TryFrom<UserRow> for UserRecord {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let action_type = row.action_type.parse::<Action>().map_err(|e| {
            StoreError::Database(format!("user {} has invalid action_type: {e}", row.id))
        })?;

        Ok(Self {
            id: row.id,
            login: row.user_login,
            nicename: row.user_nicename,
            email: row.user_email,
            credential: row.user_pass,
            registered_at: row.user_registered,
            status: row.user_status,
            display_name: row.display_name,
            first_name: row.first_name,
            last_name: row.last_name,
            phone_number: row.phone_number,
            business: BusinessRecord {
                business_name: row.business_name,
                business_email: row.business_email,
                real_address: row.real_address,
                vat_number: row.vat_number,
                billing_address: row.billing_address,
            },
            time_of_action: row.time_of_action,
            action_type,
        })
    }
}

/// Map a driver error, classifying constraint violations.
fn db_error(context: &str, error: &sqlx::Error) -> StoreError {
    if let Some(db_err) = error.as_database_error() {
        if db_err.is_unique_violation() || db_err.is_foreign_key_violation() {
            return StoreError::Constraint(format!("{context}: {db_err}"));
        }
    }
    StoreError::Database(format!("{context}: {error}"))
}

/// `PostgreSQL` user store.
///
/// Expects the `users` and `user_meta` tables to exist; schema management is left to
/// the deployment.
///
/// # Example
///
/// ```no_run
/// use user_sync_postgres::PostgresUserStore;
/// use sqlx::PgPool;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = PgPool::connect("postgresql://localhost/users").await?;
/// let store = PostgresUserStore::new(pool);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresUserStore {
    pool: PgPool,
}

impl PostgresUserStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the database cannot be reached.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to connect: {e}")))?;

        tracing::info!(max_connections = config.max_connections, "Connected to user database");
        Ok(Self::new(pool))
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to start transaction", &e))
    }

    async fn upsert_meta(
        tx: &mut Transaction<'static, Postgres>,
        user_id: i64,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO user_meta (user_id, meta_key, meta_value)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, meta_key) DO UPDATE SET meta_value = EXCLUDED.meta_value
            ",
        )
        .bind(user_id)
        .bind(key)
        .bind(value)
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("Failed to write user metadata", &e))?;
        Ok(())
    }

    async fn create_in_tx(&self, user: &NewUser) -> Result<ApplyOutcome, StoreError> {
        let mut tx = self.begin().await?;

        // ON CONFLICT keeps concurrent CREATEs for one email idempotent.
        let inserted: Option<(i64,)> = sqlx::query_as(
            r"
            INSERT INTO users (
                user_login, user_nicename, user_email, user_pass, user_registered,
                user_status, display_name, first_name, last_name, phone_number,
                business_name, business_email, real_address, vat_number, billing_address,
                time_of_action, action_type
            )
            VALUES ($1, $1, $2, $3, $4, 0, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (user_email) DO NOTHING
            RETURNING id
            ",
        )
        .bind(&user.login)
        .bind(&user.email)
        .bind(&user.credential)
        .bind(user.registered_at)
        .bind(&user.display_name)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.phone_number)
        .bind(&user.business.business_name)
        .bind(&user.business.business_email)
        .bind(&user.business.real_address)
        .bind(&user.business.vat_number)
        .bind(&user.business.billing_address)
        .bind(user.time_of_action)
        .bind(Action::Create.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to insert user", &e))?;

        let Some((id,)) = inserted else {
            let (id,): (i64,) = sqlx::query_as("SELECT id FROM users WHERE user_email = $1")
                .bind(&user.email)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| db_error("Failed to look up existing user", &e))?;
            return Ok(ApplyOutcome::AlreadyExists { id });
        };

        let time_of_action = user.time_of_action.to_rfc3339();
        for (key, value) in [
            (META_SOURCE_USER_ID, user.source_user_id.as_str()),
            (META_TIME_OF_ACTION, time_of_action.as_str()),
            (META_ACTION_TYPE, Action::Create.as_str()),
        ] {
            Self::upsert_meta(&mut tx, id, key, value).await?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", &e))?;
        Ok(ApplyOutcome::Created { id })
    }

    async fn update_in_tx(&self, patch: &UserPatch) -> Result<ApplyOutcome, StoreError> {
        let mut tx = self.begin().await?;

        let row: Option<UserRow> = sqlx::query_as(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE user_email = $1 FOR UPDATE"
        ))
        .bind(&patch.email)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to lock user", &e))?;

        let Some(row) = row else {
            return Err(StoreError::NotFound {
                email: patch.email.clone(),
            });
        };

        let mut record = UserRecord::try_from(row)?;
        patch.apply_to(&mut record);

        sqlx::query(
            r"
            UPDATE users
            SET user_pass = $2,
                first_name = $3,
                last_name = $4,
                display_name = $5,
                phone_number = $6,
                business_name = $7,
                business_email = $8,
                real_address = $9,
                vat_number = $10,
                billing_address = $11,
                time_of_action = $12,
                action_type = $13
            WHERE id = $1
            ",
        )
        .bind(record.id)
        .bind(&record.credential)
        .bind(&record.first_name)
        .bind(&record.last_name)
        .bind(&record.display_name)
        .bind(&record.phone_number)
        .bind(&record.business.business_name)
        .bind(&record.business.business_email)
        .bind(&record.business.real_address)
        .bind(&record.business.vat_number)
        .bind(&record.business.billing_address)
        .bind(record.time_of_action)
        .bind(record.action_type.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to update user", &e))?;

        let time_of_action = record.time_of_action.to_rfc3339();
        Self::upsert_meta(&mut tx, record.id, META_TIME_OF_ACTION, &time_of_action).await?;
        Self::upsert_meta(&mut tx, record.id, META_ACTION_TYPE, Action::Update.as_str()).await?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", &e))?;
        Ok(ApplyOutcome::Updated { id: record.id })
    }

    async fn delete_in_tx(&self, email: &str) -> Result<ApplyOutcome, StoreError> {
        let mut tx = self.begin().await?;

        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM users WHERE user_email = $1 FOR UPDATE")
                .bind(email)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| db_error("Failed to lock user", &e))?;

        let Some((id,)) = existing else {
            return Ok(ApplyOutcome::NotFound);
        };

        // Metadata first: user_meta.user_id references users.id.
        let metadata_rows = sqlx::query("DELETE FROM user_meta WHERE user_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to delete user metadata", &e))?
            .rows_affected();

        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to delete user", &e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", &e))?;
        Ok(ApplyOutcome::Deleted { id, metadata_rows })
    }
}

fn record_transaction(operation: &'static str, started: Instant, result: &Result<ApplyOutcome, StoreError>) {
    let outcome = match result {
        Ok(outcome) => outcome.label(),
        Err(_) => "error",
    };
    metrics::counter!(
        "user_sync_store_transactions_total",
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!("user_sync_store_transaction_duration_seconds", "operation" => operation)
        .record(started.elapsed().as_secs_f64());
}

impl UserStore for PostgresUserStore {
    fn find_by_email<'a>(&'a self, email: &'a str) -> StoreFuture<'a, Option<UserRecord>> {
        Box::pin(async move {
            let row: Option<UserRow> =
                sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE user_email = $1"))
                    .bind(email)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| db_error("Failed to get user", &e))?;
            row.map(UserRecord::try_from).transpose()
        })
    }

    fn create_user<'a>(&'a self, user: &'a NewUser) -> StoreFuture<'a, ApplyOutcome> {
        Box::pin(async move {
            let started = Instant::now();
            let result = self.create_in_tx(user).await;
            record_transaction("create", started, &result);
            tracing::debug!(email = %user.email, result = ?result, "Create transaction finished");
            result
        })
    }

    fn update_user<'a>(&'a self, patch: &'a UserPatch) -> StoreFuture<'a, ApplyOutcome> {
        Box::pin(async move {
            let started = Instant::now();
            let result = self.update_in_tx(patch).await;
            record_transaction("update", started, &result);
            tracing::debug!(email = %patch.email, result = ?result, "Update transaction finished");
            result
        })
    }

    fn delete_user<'a>(&'a self, email: &'a str) -> StoreFuture<'a, ApplyOutcome> {
        Box::pin(async move {
            let started = Instant::now();
            let result = self.delete_in_tx(email).await;
            record_transaction("delete", started, &result);
            tracing::debug!(email = %email, result = ?result, "Delete transaction finished");
            result
        })
    }
}
