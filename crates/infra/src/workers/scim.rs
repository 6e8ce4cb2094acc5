//! SCIM bridge driver.

use std::time::Duration;

use tracing::{Instrument, debug, info_span, warn};

use dispatch_core::ScimBridgeId;

use super::{PollConfig, PollingWorker, catch_failure};
use crate::scim_bridges::{ScimBridge, ScimBridgeStore, SyncScheduler};
use crate::store::{Store, StoreError, StoreResult};

/// Pushes one directory's users into the SCIM configuration.
#[async_trait::async_trait]
pub trait DirectorySynchronizer: Send + Sync {
    async fn sync(&self, bridge: &ScimBridge) -> anyhow::Result<()>;
}

/// Claims due bridges and runs their sync outside any transaction.
#[derive(Debug)]
pub struct ScimSyncWorker<S, D> {
    scheduler: SyncScheduler<S>,
    synchronizer: D,
    staleness_threshold: Duration,
    poll: PollConfig,
}

impl<S: ScimBridgeStore, D: DirectorySynchronizer> ScimSyncWorker<S, D> {
    pub fn new(
        scheduler: SyncScheduler<S>,
        synchronizer: D,
        staleness_threshold: Duration,
        poll: PollConfig,
    ) -> Self {
        Self {
            scheduler,
            synchronizer,
            staleness_threshold,
            poll,
        }
    }

    /// Claim a due bridge and commit it as Syncing.
    async fn begin(&self) -> StoreResult<Option<ScimBridge>> {
        let store = self.scheduler.store();
        let mut tx = store.begin().await?;

        let mut bridge = match self
            .scheduler
            .claim_next_due(&mut tx, self.staleness_threshold)
            .await
        {
            Ok(bridge) => bridge,
            Err(err) if err.is_empty_queue() => {
                store.rollback(tx).await?;
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        self.scheduler.begin_sync(&mut tx, &mut bridge).await?;
        store.commit(tx).await?;
        Ok(Some(bridge))
    }
}

#[async_trait::async_trait]
impl<S, D> PollingWorker for ScimSyncWorker<S, D>
where
    S: ScimBridgeStore,
    D: DirectorySynchronizer,
{
    type Id = ScimBridgeId;

    fn name(&self) -> &'static str {
        "scim_bridges"
    }

    fn poll_config(&self) -> &PollConfig {
        &self.poll
    }

    async fn run_next(&self) -> StoreResult<Option<ScimBridgeId>> {
        let Some(bridge) = self.begin().await? else {
            return Ok(None);
        };

        let span = info_span!(
            "scim_sync",
            bridge.id = %bridge.id,
            organization.id = %bridge.organization_id
        );
        async move {
            debug!("running directory sync");
            let result = catch_failure(self.synchronizer.sync(&bridge)).await;

            let store = self.scheduler.store();
            let mut tx = store.begin().await?;
            let recorded = match result {
                Ok(()) => self.scheduler.record_success(&mut tx, &bridge).await,
                Err(error) => self.scheduler.record_failure(&mut tx, &bridge, error).await,
            };
            match recorded {
                Ok(_) => store.commit(tx).await?,
                // Disabled or otherwise moved on while the sync ran.
                Err(StoreError::InvalidTransition(reason)) => {
                    warn!(%reason, "discarding sync outcome");
                    store.rollback(tx).await?;
                }
                Err(err) => return Err(err),
            }
            Ok::<_, StoreError>(Some(bridge.id))
        }
        .instrument(span)
        .await
    }
}
