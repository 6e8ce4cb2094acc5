//! SCIM bridge sync scheduler.
//!
//! A bridge is due when it is Active/Failed and its `next_sync_at` has passed,
//! or when it has sat in Syncing longer than the staleness threshold (the
//! worker that claimed it is presumed dead).
//!
//! The sync itself runs outside any transaction:
//!
//! 1. tx1: [`SyncScheduler::claim_next_due`] + [`SyncScheduler::begin_sync`], commit
//! 2. call the directory API
//! 3. tx2: [`SyncScheduler::record_success`] or [`SyncScheduler::record_failure`], commit
//!
//! Lock hold time is bounded by step 1; the price is that a crash between 1
//! and 3 is only recovered once the staleness threshold elapses.

pub mod memory;
pub mod policy;
pub mod postgres;
pub mod types;

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use dispatch_core::{ScimBridgeId, ScimConfigurationId, Scope};

use crate::store::{Store, StoreError, StoreResult};

pub use policy::{BackoffPolicy, BackoffStrategy, SyncPolicy};
pub use types::{NewScimBridge, ScimBridge, ScimBridgeState, ScimBridgeType};

/// Persistence for SCIM bridges.
#[async_trait::async_trait]
pub trait ScimBridgeStore: Store {
    /// Insert a bridge. One bridge per SCIM configuration.
    async fn insert_scim_bridge(&self, tx: &mut Self::Tx, bridge: &ScimBridge)
    -> StoreResult<()>;

    async fn load_scim_bridge(
        &self,
        tx: &mut Self::Tx,
        scope: &Scope,
        id: ScimBridgeId,
    ) -> StoreResult<ScimBridge>;

    /// Load and row-lock a bridge for the rest of the transaction.
    async fn lock_scim_bridge(
        &self,
        tx: &mut Self::Tx,
        scope: &Scope,
        id: ScimBridgeId,
    ) -> StoreResult<ScimBridge>;

    async fn load_scim_bridge_by_scim_configuration_id(
        &self,
        tx: &mut Self::Tx,
        scope: &Scope,
        scim_configuration_id: ScimConfigurationId,
    ) -> StoreResult<ScimBridge>;

    /// Claim the most overdue bridge across all organizations.
    ///
    /// Eligible: Active/Failed with `next_sync_at` NULL or `<= now`, or Syncing
    /// with `updated_at < stale_before`. Ordered by `next_sync_at`, NULLs first.
    /// Returns `NoScimBridgeAvailable` when nothing is due.
    async fn claim_next_due_scim_bridge(
        &self,
        tx: &mut Self::Tx,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<ScimBridge>;

    /// Persist the mutable sync state of `bridge`.
    async fn update_scim_bridge(
        &self,
        tx: &mut Self::Tx,
        scope: &Scope,
        bridge: &ScimBridge,
    ) -> StoreResult<()>;

    async fn delete_scim_bridge(
        &self,
        tx: &mut Self::Tx,
        scope: &Scope,
        id: ScimBridgeId,
    ) -> StoreResult<()>;
}

/// SCIM bridge scheduler.
#[derive(Debug, Clone)]
pub struct SyncScheduler<S> {
    store: S,
    policy: SyncPolicy,
}

impl<S: ScimBridgeStore> SyncScheduler<S> {
    pub fn new(store: S, policy: SyncPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    /// Provision a bridge; it is due immediately.
    pub async fn create(
        &self,
        tx: &mut S::Tx,
        scope: &Scope,
        bridge: NewScimBridge,
    ) -> StoreResult<ScimBridge> {
        if !scope.contains(bridge.organization_id) {
            return Err(StoreError::not_found("organization", bridge.organization_id));
        }
        let bridge = bridge.into_bridge(Utc::now());
        self.store.insert_scim_bridge(tx, &bridge).await?;
        debug!(bridge_id = %bridge.id, "scim bridge created");
        Ok(bridge)
    }

    pub async fn load_by_id(
        &self,
        tx: &mut S::Tx,
        scope: &Scope,
        id: ScimBridgeId,
    ) -> StoreResult<ScimBridge> {
        self.store.load_scim_bridge(tx, scope, id).await
    }

    pub async fn load_by_scim_configuration_id(
        &self,
        tx: &mut S::Tx,
        scope: &Scope,
        scim_configuration_id: ScimConfigurationId,
    ) -> StoreResult<ScimBridge> {
        self.store
            .load_scim_bridge_by_scim_configuration_id(tx, scope, scim_configuration_id)
            .await
    }

    /// Claim the next due or abandoned bridge.
    pub async fn claim_next_due(
        &self,
        tx: &mut S::Tx,
        staleness_threshold: Duration,
    ) -> StoreResult<ScimBridge> {
        let now = Utc::now();
        let stale_before = chrono::Duration::from_std(staleness_threshold)
            .ok()
            .and_then(|threshold| now.checked_sub_signed(threshold))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let bridge = self
            .store
            .claim_next_due_scim_bridge(tx, now, stale_before)
            .await?;

        if bridge.state == ScimBridgeState::Syncing {
            warn!(
                bridge_id = %bridge.id,
                last_heartbeat = %bridge.updated_at,
                "reclaiming scim bridge abandoned in syncing state"
            );
        }
        Ok(bridge)
    }

    /// Move a claimed bridge to Syncing. Commit right after this call.
    pub async fn begin_sync(&self, tx: &mut S::Tx, bridge: &mut ScimBridge) -> StoreResult<()> {
        bridge.begin_sync(Utc::now())?;
        self.store
            .update_scim_bridge(tx, &Scope::organization(bridge.organization_id), bridge)
            .await
    }

    /// Record a successful sync on the current row.
    pub async fn record_success(
        &self,
        tx: &mut S::Tx,
        bridge: &ScimBridge,
    ) -> StoreResult<ScimBridge> {
        let scope = Scope::organization(bridge.organization_id);
        let mut current = self.store.lock_scim_bridge(tx, &scope, bridge.id).await?;
        current.record_success(Utc::now(), &self.policy)?;
        self.store.update_scim_bridge(tx, &scope, &current).await?;
        debug!(
            bridge_id = %current.id,
            next_sync_at = ?current.next_sync_at,
            "scim bridge sync succeeded"
        );
        Ok(current)
    }

    /// Record a failed sync on the current row and back off.
    pub async fn record_failure(
        &self,
        tx: &mut S::Tx,
        bridge: &ScimBridge,
        error: impl Into<String> + Send,
    ) -> StoreResult<ScimBridge> {
        let scope = Scope::organization(bridge.organization_id);
        let mut current = self.store.lock_scim_bridge(tx, &scope, bridge.id).await?;
        current.record_failure(error.into(), Utc::now(), &self.policy)?;
        self.store.update_scim_bridge(tx, &scope, &current).await?;
        warn!(
            bridge_id = %current.id,
            consecutive_failures = current.consecutive_failures,
            next_sync_at = ?current.next_sync_at,
            error = current.sync_error.as_deref().unwrap_or_default(),
            "scim bridge sync failed"
        );
        Ok(current)
    }

    pub async fn update_excluded_user_names(
        &self,
        tx: &mut S::Tx,
        scope: &Scope,
        id: ScimBridgeId,
        excluded_user_names: Vec<String>,
    ) -> StoreResult<ScimBridge> {
        let mut bridge = self.store.lock_scim_bridge(tx, scope, id).await?;
        bridge.excluded_user_names = excluded_user_names;
        bridge.updated_at = Utc::now();
        self.store.update_scim_bridge(tx, scope, &bridge).await?;
        Ok(bridge)
    }

    pub async fn disable(
        &self,
        tx: &mut S::Tx,
        scope: &Scope,
        id: ScimBridgeId,
    ) -> StoreResult<ScimBridge> {
        let mut bridge = self.store.lock_scim_bridge(tx, scope, id).await?;
        bridge.disable(Utc::now());
        self.store.update_scim_bridge(tx, scope, &bridge).await?;
        Ok(bridge)
    }

    pub async fn enable(
        &self,
        tx: &mut S::Tx,
        scope: &Scope,
        id: ScimBridgeId,
    ) -> StoreResult<ScimBridge> {
        let mut bridge = self.store.lock_scim_bridge(tx, scope, id).await?;
        bridge.enable(Utc::now())?;
        self.store.update_scim_bridge(tx, scope, &bridge).await?;
        Ok(bridge)
    }

    /// Remove the bridge when SCIM is torn down.
    pub async fn delete(&self, tx: &mut S::Tx, scope: &Scope, id: ScimBridgeId) -> StoreResult<()> {
        self.store.delete_scim_bridge(tx, scope, id).await
    }
}
