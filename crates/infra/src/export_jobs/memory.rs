//! In-memory export job persistence.

use dispatch_core::{ExportJobId, Scope};

use super::{ExportJob, ExportJobStatus, ExportJobStore};
use crate::store::memory::{MemoryRow, RowKey};
use crate::store::{InMemoryStore, MemoryTx, StoreError, StoreResult};

const RESOURCE: &str = "export job";

impl InMemoryStore {
    /// Committed export jobs, for inspection in tests.
    pub fn export_jobs(&self) -> Vec<ExportJob> {
        self.committed_rows()
    }
}

#[async_trait::async_trait]
impl ExportJobStore for InMemoryStore {
    async fn insert_export_job(&self, tx: &mut MemoryTx, job: &ExportJob) -> StoreResult<()> {
        let mut state = tx.state();
        if state.row::<ExportJob>(job.id).is_some() {
            return Err(StoreError::already_exists(RESOURCE, job.id.to_string()));
        }
        state.try_lock(ExportJob::row_key(job.id));
        state.put(job.clone());
        Ok(())
    }

    async fn load_export_job(
        &self,
        tx: &mut MemoryTx,
        scope: &Scope,
        id: ExportJobId,
    ) -> StoreResult<ExportJob> {
        tx.state()
            .row::<ExportJob>(id)
            .filter(|job| scope.contains(job.organization_id))
            .ok_or_else(|| StoreError::not_found(RESOURCE, id))
    }

    async fn claim_next_pending_export_job(&self, tx: &mut MemoryTx) -> StoreResult<ExportJob> {
        let mut state = tx.state();
        let mut pending: Vec<ExportJob> = state
            .rows::<ExportJob>()
            .into_iter()
            .filter(|job| job.status == ExportJobStatus::Pending)
            .collect();
        pending.sort_by_key(|job| (job.created_at, job.id));

        pending
            .into_iter()
            .find(|job| state.try_lock(RowKey::ExportJob(job.id)))
            .ok_or(StoreError::NoExportJobAvailable)
    }

    async fn update_export_job(
        &self,
        tx: &mut MemoryTx,
        scope: &Scope,
        job: &ExportJob,
    ) -> StoreResult<()> {
        let mut state = tx.state();
        let current = state
            .row::<ExportJob>(job.id)
            .filter(|current| scope.contains(current.organization_id))
            .ok_or_else(|| StoreError::not_found(RESOURCE, job.id))?;
        if !state.try_lock(RowKey::ExportJob(job.id)) {
            return Err(StoreError::RowLocked {
                resource: RESOURCE,
                id: job.id.to_string(),
            });
        }

        state.put(ExportJob {
            status: job.status,
            error: job.error.clone(),
            file_id: job.file_id,
            started_at: job.started_at,
            completed_at: job.completed_at,
            ..current
        });
        Ok(())
    }
}
