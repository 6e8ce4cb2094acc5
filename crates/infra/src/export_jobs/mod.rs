//! Bulk export job queue.
//!
//! One-shot jobs created PENDING by the requesting workflow and claimed by
//! export workers. A claimed job stays locked for the whole processing
//! transaction, so a crashed worker leaves it PENDING and claimable again.
//! FAILED is terminal: nothing here re-enqueues a job.

pub mod memory;
pub mod postgres;
pub mod types;

use chrono::Utc;
use tracing::debug;

use dispatch_core::{ExportJobId, Scope};

use crate::store::{Store, StoreError, StoreResult};

pub use types::{
    DocumentExportArguments, ExportArguments, ExportJob, ExportJobStatus, ExportJobType,
    ExportOutcome, FrameworkExportArguments, NewExportJob,
};

/// Persistence for export jobs.
#[async_trait::async_trait]
pub trait ExportJobStore: Store {
    /// Insert a new row. Fails with `ResourceAlreadyExists` on a duplicate id.
    async fn insert_export_job(&self, tx: &mut Self::Tx, job: &ExportJob) -> StoreResult<()>;

    /// Load a job visible in `scope`.
    async fn load_export_job(
        &self,
        tx: &mut Self::Tx,
        scope: &Scope,
        id: ExportJobId,
    ) -> StoreResult<ExportJob>;

    /// Claim the oldest PENDING job across all organizations.
    ///
    /// Returns `NoExportJobAvailable` when every pending row is locked or none exist.
    async fn claim_next_pending_export_job(&self, tx: &mut Self::Tx) -> StoreResult<ExportJob>;

    /// Persist status, error, file and timestamps of `job`.
    async fn update_export_job(
        &self,
        tx: &mut Self::Tx,
        scope: &Scope,
        job: &ExportJob,
    ) -> StoreResult<()>;
}

/// Export job queue manager.
#[derive(Debug, Clone)]
pub struct ExportJobQueue<S> {
    store: S,
}

impl<S: ExportJobStore> ExportJobQueue<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Create a PENDING job in `scope`.
    pub async fn enqueue(
        &self,
        tx: &mut S::Tx,
        scope: &Scope,
        job: NewExportJob,
    ) -> StoreResult<ExportJob> {
        if !scope.contains(job.organization_id) {
            return Err(StoreError::not_found(
                "organization",
                job.organization_id,
            ));
        }

        let job = job.into_job(Utc::now());
        self.store.insert_export_job(tx, &job).await?;
        debug!(job_id = %job.id, job_type = job.job_type().as_str(), "export job enqueued");
        Ok(job)
    }

    /// Claim the next pending job. The row stays locked until `tx` ends.
    pub async fn claim_next_pending(&self, tx: &mut S::Tx) -> StoreResult<ExportJob> {
        self.store.claim_next_pending_export_job(tx).await
    }

    /// Mark a claimed job PROCESSING before running it.
    pub async fn start(&self, tx: &mut S::Tx, job: &mut ExportJob) -> StoreResult<()> {
        job.start(Utc::now())?;
        self.store
            .update_export_job(tx, &Scope::organization(job.organization_id), job)
            .await
    }

    /// Record the terminal outcome of a processed job.
    pub async fn complete(
        &self,
        tx: &mut S::Tx,
        job: &mut ExportJob,
        outcome: ExportOutcome,
    ) -> StoreResult<()> {
        job.complete(outcome, Utc::now())?;
        self.store
            .update_export_job(tx, &Scope::organization(job.organization_id), job)
            .await?;
        debug!(job_id = %job.id, status = job.status.as_str(), "export job completed");
        Ok(())
    }

    pub async fn load_by_id(
        &self,
        tx: &mut S::Tx,
        scope: &Scope,
        id: ExportJobId,
    ) -> StoreResult<ExportJob> {
        self.store.load_export_job(tx, scope, id).await
    }
}
