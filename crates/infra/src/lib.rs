//! Infrastructure layer: transactional job queues, their Postgres and
//! in-memory stores, configuration and the polling worker drivers.

pub mod config;
pub mod export_jobs;
pub mod schema;
pub mod scim_bridges;
pub mod slack_messages;
pub mod store;
pub mod workers;

mod integration_tests;

pub use config::{ConfigError, DatabaseConfig, DispatchConfig};
pub use export_jobs::{ExportJobQueue, ExportJobStore};
pub use scim_bridges::{ScimBridgeStore, SyncScheduler};
pub use slack_messages::{OutboxRelay, SlackMessageStore};
pub use store::{InMemoryStore, MemoryTx, PgStore, Store, StoreError, StoreResult};
pub use workers::{PollConfig, PollingWorker, WorkerHandle};
