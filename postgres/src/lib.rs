//! `PostgreSQL` persistence for the boxoffice order processing engine.
//!
//! This crate implements the storage traits from `boxoffice-core` on top of sqlx:
//!
//! - [`PostgresStockLedger`]: row-locked, all-or-nothing reservations
//! - [`PostgresOrderRepository`]: order snapshots with compare-and-set status updates
//! - [`PostgresWebhookStore`]: `ON CONFLICT DO NOTHING` idempotency records
//! - [`PostgresModifierRepository`]: fee and coupon definitions plus redemption counts
//!
//! # Example
//!
//! ```ignore
//! use boxoffice_postgres::{connect, migrate, PostgresStockLedger};
//!
//! async fn example(config: &boxoffice_core::config::PostgresConfig) -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = connect(config).await?;
//!     migrate(&pool).await?;
//!     let ledger = PostgresStockLedger::new(pool);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use boxoffice_core::config::PostgresConfig;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use thiserror::Error;

mod modifier_repository;
mod order_repository;
mod stock_ledger;
mod webhook_store;

pub use modifier_repository::PostgresModifierRepository;
pub use order_repository::PostgresOrderRepository;
pub use stock_ledger::PostgresStockLedger;
pub use webhook_store::PostgresWebhookStore;

/// Pool setup failures.
#[derive(Error, Debug)]
pub enum PostgresError {
    /// Could not open the pool.
    #[error("Failed to connect to PostgreSQL: {0}")]
    Connect(String),

    /// Schema migration failed.
    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Opens a connection pool from configuration.
///
/// # Errors
///
/// Returns [`PostgresError::Connect`] if the database is unreachable.
pub async fn connect(config: &PostgresConfig) -> Result<PgPool, PostgresError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout))
        .connect(&config.url)
        .await
        .map_err(|e| PostgresError::Connect(e.to_string()))?;
    tracing::info!(max_connections = config.max_connections, "PostgreSQL pool ready");
    Ok(pool)
}

/// Applies the bundled schema migrations.
///
/// # Errors
///
/// Returns [`PostgresError::Migration`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), PostgresError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| PostgresError::Migration(e.to_string()))
}

/// Converts a database count to the ledger's unsigned representation.
pub(crate) fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Converts a ledger count for binding.
pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
