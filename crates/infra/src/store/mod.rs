//! Transactional storage boundary.
//!
//! Every queue manager is written against [`Store`] plus its entity trait
//! ([`ExportJobStore`](crate::export_jobs::ExportJobStore),
//! [`ScimBridgeStore`](crate::scim_bridges::ScimBridgeStore),
//! [`SlackMessageStore`](crate::slack_messages::SlackMessageStore)).
//!
//! ## Claim semantics
//!
//! A claim selects at most one eligible row, oldest first, locks it for the
//! enclosing transaction and skips rows locked by other transactions. The lock
//! lives exactly as long as the transaction: commit persists the new state,
//! rollback (or dropping the transaction) releases the row unchanged.

pub mod error;
pub mod memory;
pub mod postgres;

pub use error::StoreError;
pub use memory::{InMemoryStore, MemoryTx};
pub use postgres::PgStore;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// A store that hands out transactions.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Open transaction. Dropping it without [`Store::commit`] rolls it back.
    type Tx: Send;

    async fn begin(&self) -> StoreResult<Self::Tx>;

    async fn commit(&self, tx: Self::Tx) -> StoreResult<()>;

    async fn rollback(&self, tx: Self::Tx) -> StoreResult<()>;
}
