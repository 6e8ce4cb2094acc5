//! In-memory SCIM bridge persistence.

use chrono::{DateTime, Utc};

use dispatch_core::{ScimBridgeId, ScimConfigurationId, Scope};

use super::{ScimBridge, ScimBridgeStore};
use crate::store::memory::{RowKey, TxState};
use crate::store::{InMemoryStore, MemoryTx, StoreError, StoreResult};

const RESOURCE: &str = "scim bridge";

impl InMemoryStore {
    /// Committed SCIM bridges, for inspection in tests.
    pub fn scim_bridges(&self) -> Vec<ScimBridge> {
        self.committed_rows()
    }
}

fn scoped(state: &TxState<'_>, scope: &Scope, id: ScimBridgeId) -> StoreResult<ScimBridge> {
    state
        .row::<ScimBridge>(id)
        .filter(|bridge| scope.contains(bridge.organization_id))
        .ok_or_else(|| StoreError::not_found(RESOURCE, id))
}

fn lock(state: &mut TxState<'_>, id: ScimBridgeId) -> StoreResult<()> {
    if state.try_lock(RowKey::ScimBridge(id)) {
        Ok(())
    } else {
        Err(StoreError::RowLocked {
            resource: RESOURCE,
            id: id.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl ScimBridgeStore for InMemoryStore {
    async fn insert_scim_bridge(&self, tx: &mut MemoryTx, bridge: &ScimBridge) -> StoreResult<()> {
        let mut state = tx.state();
        if state.row::<ScimBridge>(bridge.id).is_some() {
            return Err(StoreError::already_exists(RESOURCE, bridge.id.to_string()));
        }
        if state
            .rows::<ScimBridge>()
            .iter()
            .any(|other| other.scim_configuration_id == bridge.scim_configuration_id)
        {
            return Err(StoreError::already_exists(
                RESOURCE,
                format!("scim configuration {}", bridge.scim_configuration_id),
            ));
        }
        state.try_lock(RowKey::ScimBridge(bridge.id));
        state.put(bridge.clone());
        Ok(())
    }

    async fn load_scim_bridge(
        &self,
        tx: &mut MemoryTx,
        scope: &Scope,
        id: ScimBridgeId,
    ) -> StoreResult<ScimBridge> {
        scoped(&tx.state(), scope, id)
    }

    async fn lock_scim_bridge(
        &self,
        tx: &mut MemoryTx,
        scope: &Scope,
        id: ScimBridgeId,
    ) -> StoreResult<ScimBridge> {
        let mut state = tx.state();
        let bridge = scoped(&state, scope, id)?;
        lock(&mut state, id)?;
        Ok(bridge)
    }

    async fn load_scim_bridge_by_scim_configuration_id(
        &self,
        tx: &mut MemoryTx,
        scope: &Scope,
        scim_configuration_id: ScimConfigurationId,
    ) -> StoreResult<ScimBridge> {
        tx.state()
            .rows::<ScimBridge>()
            .into_iter()
            .find(|bridge| {
                bridge.scim_configuration_id == scim_configuration_id
                    && scope.contains(bridge.organization_id)
            })
            .ok_or_else(|| StoreError::not_found(RESOURCE, scim_configuration_id))
    }

    async fn claim_next_due_scim_bridge(
        &self,
        tx: &mut MemoryTx,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<ScimBridge> {
        let mut state = tx.state();
        let mut due: Vec<ScimBridge> = state
            .rows::<ScimBridge>()
            .into_iter()
            .filter(|bridge| bridge.is_due(now) || bridge.is_stale(stale_before))
            .collect();
        // NULLS FIRST: `None` sorts before `Some`.
        due.sort_by_key(|bridge| (bridge.next_sync_at, bridge.created_at, bridge.id));

        due.into_iter()
            .find(|bridge| state.try_lock(RowKey::ScimBridge(bridge.id)))
            .ok_or(StoreError::NoScimBridgeAvailable)
    }

    async fn update_scim_bridge(
        &self,
        tx: &mut MemoryTx,
        scope: &Scope,
        bridge: &ScimBridge,
    ) -> StoreResult<()> {
        let mut state = tx.state();
        let current = scoped(&state, scope, bridge.id)?;
        lock(&mut state, bridge.id)?;

        state.put(ScimBridge {
            state: bridge.state,
            excluded_user_names: bridge.excluded_user_names.clone(),
            last_synced_at: bridge.last_synced_at,
            next_sync_at: bridge.next_sync_at,
            sync_error: bridge.sync_error.clone(),
            consecutive_failures: bridge.consecutive_failures,
            total_sync_count: bridge.total_sync_count,
            total_failure_count: bridge.total_failure_count,
            updated_at: bridge.updated_at,
            ..current
        });
        Ok(())
    }

    async fn delete_scim_bridge(
        &self,
        tx: &mut MemoryTx,
        scope: &Scope,
        id: ScimBridgeId,
    ) -> StoreResult<()> {
        let mut state = tx.state();
        scoped(&state, scope, id)?;
        lock(&mut state, id)?;
        state.delete::<ScimBridge>(id);
        Ok(())
    }
}
