//! `PostgreSQL` apply layer for user synchronization.
//!
//! This crate provides [`PostgresUserStore`], which implements the `UserStore` trait
//! from `user-sync-core` against a relational schema of two tables:
//!
//! - `users`: one row per user, unique on `user_email`
//! - `user_meta`: key/value rows per user, unique on `(user_id, meta_key)`
//!
//! Each apply operation is a single transaction, so a failure leaves no partial
//! writes behind and the consumer can safely reject the message.
//!
//! # Example
//!
//! ```no_run
//! use user_sync_core::config::DatabaseConfig;
//! use user_sync_postgres::PostgresUserStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DatabaseConfig::new("postgres://localhost/users");
//! let store = PostgresUserStore::connect(&config).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod user_store;

pub use user_store::PostgresUserStore;
