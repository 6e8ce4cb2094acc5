//! Postgres store plumbing shared by the entity implementations.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `ResourceAlreadyExists` (mapped at the insert site) |
//! | Database (other) | Any other | `Database` |
//! | RowNotFound | N/A | `ResourceNotFound` (`resource = "row"`, `id` = operation) |
//! | PoolClosed | N/A | `Database` |
//! | Other | N/A | `Database` |
//!
//! ## Claims
//!
//! Claim queries end in `LIMIT 1 FOR UPDATE SKIP LOCKED`, so concurrent
//! workers always receive disjoint rows and never wait on each other.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::instrument;

use super::{Store, StoreError, StoreResult};
use crate::config::DatabaseConfig;

/// Postgres-backed store for all three queues.
///
/// Uses the SQLx pool, which is `Send + Sync` and cheap to clone.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a pool from configuration.
    #[instrument(skip(config), fields(max_connections = config.max_connections), err)]
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Store for PgStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> StoreResult<Self::Tx> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn commit(&self, tx: Self::Tx) -> StoreResult<()> {
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(&self, tx: Self::Tx) -> StoreResult<()> {
        tx.rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Map SQLx errors to StoreError, keeping the operation name.
pub(crate) fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::database(
            operation,
            match db_err.code() {
                Some(code) => format!("{} (code {})", db_err.message(), code),
                None => db_err.message().to_string(),
            },
        ),
        sqlx::Error::RowNotFound => StoreError::not_found("row", operation),
        sqlx::Error::PoolClosed => StoreError::database(operation, "connection pool closed"),
        other => StoreError::database(operation, other.to_string()),
    }
}

/// Check if an error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

/// Convert a row counter to the domain's unsigned representation.
pub(crate) fn counter(resource: &'static str, value: i64) -> StoreResult<u64> {
    u64::try_from(value)
        .map_err(|_| StoreError::decode(resource, format!("negative counter {value}")))
}
