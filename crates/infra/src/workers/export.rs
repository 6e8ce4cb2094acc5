//! Export job driver.

use tracing::{Instrument, debug, info_span, warn};

use dispatch_core::{ExportJobId, FileId};

use super::{PollConfig, PollingWorker, catch_failure};
use crate::export_jobs::{ExportJob, ExportJobQueue, ExportJobStore, ExportOutcome};
use crate::store::{Store, StoreError, StoreResult};

/// Builds the export bundle for a job (rendering, zipping, upload, email).
#[async_trait::async_trait]
pub trait ExportProcessor: Send + Sync {
    /// Returns the stored file, if the export produced one.
    async fn process(&self, job: &ExportJob) -> anyhow::Result<Option<FileId>>;
}

/// Claims and processes export jobs one at a time.
///
/// The claim, the processing and the outcome share one transaction, so the
/// row lock is held until the job is terminal.
#[derive(Debug)]
pub struct ExportWorker<S, P> {
    queue: ExportJobQueue<S>,
    processor: P,
    poll: PollConfig,
}

impl<S: ExportJobStore, P: ExportProcessor> ExportWorker<S, P> {
    pub fn new(queue: ExportJobQueue<S>, processor: P, poll: PollConfig) -> Self {
        Self {
            queue,
            processor,
            poll,
        }
    }
}

#[async_trait::async_trait]
impl<S, P> PollingWorker for ExportWorker<S, P>
where
    S: ExportJobStore,
    P: ExportProcessor,
{
    type Id = ExportJobId;

    fn name(&self) -> &'static str {
        "export_jobs"
    }

    fn poll_config(&self) -> &PollConfig {
        &self.poll
    }

    async fn run_next(&self) -> StoreResult<Option<ExportJobId>> {
        let store = self.queue.store();
        let mut tx = store.begin().await?;

        let mut job = match self.queue.claim_next_pending(&mut tx).await {
            Ok(job) => job,
            Err(err) if err.is_empty_queue() => {
                store.rollback(tx).await?;
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let span = info_span!("export_job", job.id = %job.id, job.type = job.job_type().as_str());
        async move {
            self.queue.start(&mut tx, &mut job).await?;
            debug!("running export job");

            let outcome = match catch_failure(self.processor.process(&job)).await {
                Ok(file_id) => ExportOutcome::Succeeded { file_id },
                Err(error) => {
                    warn!(%error, "export job failed");
                    ExportOutcome::Failed { error }
                }
            };

            self.queue.complete(&mut tx, &mut job, outcome).await?;
            store.commit(tx).await?;
            Ok::<_, StoreError>(Some(job.id))
        }
        .instrument(span)
        .await
    }
}
