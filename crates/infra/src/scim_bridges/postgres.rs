//! Postgres SCIM bridge persistence (`iam_scim_bridges` table).

use chrono::{DateTime, Utc};
use sqlx::{Postgres, Row, Transaction};
use tracing::instrument;

use dispatch_core::{ConnectorId, OrganizationId, ScimBridgeId, ScimConfigurationId, Scope};

use super::{ScimBridge, ScimBridgeState, ScimBridgeStore, ScimBridgeType};
use crate::store::postgres::{counter, is_unique_violation, map_sqlx_error};
use crate::store::{PgStore, StoreError, StoreResult};

const RESOURCE: &str = "scim bridge";

const COLUMNS: &str = r#"
    id,
    organization_id,
    scim_configuration_id,
    connector_id,
    type,
    state,
    excluded_user_names,
    last_synced_at,
    next_sync_at,
    sync_error,
    consecutive_failures,
    total_sync_count,
    total_failure_count,
    created_at,
    updated_at
"#;

#[async_trait::async_trait]
impl ScimBridgeStore for PgStore {
    #[instrument(
        skip(self, tx, bridge),
        fields(bridge_id = %bridge.id, organization_id = %bridge.organization_id),
        err
    )]
    async fn insert_scim_bridge(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        bridge: &ScimBridge,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO iam_scim_bridges (
                id,
                organization_id,
                scim_configuration_id,
                connector_id,
                type,
                state,
                excluded_user_names,
                last_synced_at,
                next_sync_at,
                sync_error,
                consecutive_failures,
                total_sync_count,
                total_failure_count,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(bridge.id.as_uuid())
        .bind(bridge.organization_id.as_uuid())
        .bind(bridge.scim_configuration_id.as_uuid())
        .bind(bridge.connector_id.as_uuid())
        .bind(bridge.bridge_type.as_str())
        .bind(bridge.state.as_str())
        .bind(&bridge.excluded_user_names)
        .bind(bridge.last_synced_at)
        .bind(bridge.next_sync_at)
        .bind(&bridge.sync_error)
        .bind(i64::from(bridge.consecutive_failures))
        .bind(i64::try_from(bridge.total_sync_count).unwrap_or(i64::MAX))
        .bind(i64::try_from(bridge.total_failure_count).unwrap_or(i64::MAX))
        .bind(bridge.created_at)
        .bind(bridge.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::already_exists(
                    RESOURCE,
                    format!("scim configuration {}", bridge.scim_configuration_id),
                )
            } else {
                map_sqlx_error("insert_scim_bridge", e)
            }
        })?;

        Ok(())
    }

    #[instrument(skip(self, tx), fields(bridge_id = %id), err)]
    async fn load_scim_bridge(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        scope: &Scope,
        id: ScimBridgeId,
    ) -> StoreResult<ScimBridge> {
        let query = format!(
            "SELECT {COLUMNS} FROM iam_scim_bridges
             WHERE id = $1 AND ($2::uuid IS NULL OR organization_id = $2)"
        );

        let row = sqlx::query(&query)
            .bind(id.as_uuid())
            .bind(scope.organization_filter())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("load_scim_bridge", e))?;

        match row {
            Some(row) => ScimBridgeRow::from_pg_row(&row)?.try_into(),
            None => Err(StoreError::not_found(RESOURCE, id)),
        }
    }

    #[instrument(skip(self, tx), fields(bridge_id = %id), err)]
    async fn lock_scim_bridge(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        scope: &Scope,
        id: ScimBridgeId,
    ) -> StoreResult<ScimBridge> {
        let query = format!(
            "SELECT {COLUMNS} FROM iam_scim_bridges
             WHERE id = $1 AND ($2::uuid IS NULL OR organization_id = $2)
             FOR UPDATE"
        );

        let row = sqlx::query(&query)
            .bind(id.as_uuid())
            .bind(scope.organization_filter())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("lock_scim_bridge", e))?;

        match row {
            Some(row) => ScimBridgeRow::from_pg_row(&row)?.try_into(),
            None => Err(StoreError::not_found(RESOURCE, id)),
        }
    }

    #[instrument(skip(self, tx), fields(scim_configuration_id = %scim_configuration_id), err)]
    async fn load_scim_bridge_by_scim_configuration_id(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        scope: &Scope,
        scim_configuration_id: ScimConfigurationId,
    ) -> StoreResult<ScimBridge> {
        let query = format!(
            "SELECT {COLUMNS} FROM iam_scim_bridges
             WHERE scim_configuration_id = $1 AND ($2::uuid IS NULL OR organization_id = $2)"
        );

        let row = sqlx::query(&query)
            .bind(scim_configuration_id.as_uuid())
            .bind(scope.organization_filter())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("load_scim_bridge_by_scim_configuration_id", e))?;

        match row {
            Some(row) => ScimBridgeRow::from_pg_row(&row)?.try_into(),
            None => Err(StoreError::not_found(RESOURCE, scim_configuration_id)),
        }
    }

    #[instrument(skip(self, tx))]
    async fn claim_next_due_scim_bridge(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<ScimBridge> {
        let query = format!(
            "SELECT {COLUMNS} FROM iam_scim_bridges
             WHERE (state IN ($1, $2) AND (next_sync_at IS NULL OR next_sync_at <= $4))
                OR (state = $3 AND updated_at < $5)
             ORDER BY next_sync_at ASC NULLS FIRST, created_at ASC, id ASC
             LIMIT 1
             FOR UPDATE SKIP LOCKED"
        );

        let row = sqlx::query(&query)
            .bind(ScimBridgeState::Active.as_str())
            .bind(ScimBridgeState::Failed.as_str())
            .bind(ScimBridgeState::Syncing.as_str())
            .bind(now)
            .bind(stale_before)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("claim_next_due_scim_bridge", e))?;

        match row {
            Some(row) => ScimBridgeRow::from_pg_row(&row)?.try_into(),
            None => Err(StoreError::NoScimBridgeAvailable),
        }
    }

    #[instrument(
        skip(self, tx, bridge),
        fields(bridge_id = %bridge.id, state = bridge.state.as_str()),
        err
    )]
    async fn update_scim_bridge(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        scope: &Scope,
        bridge: &ScimBridge,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE iam_scim_bridges
            SET
                state = $3,
                excluded_user_names = $4,
                last_synced_at = $5,
                next_sync_at = $6,
                sync_error = $7,
                consecutive_failures = $8,
                total_sync_count = $9,
                total_failure_count = $10,
                updated_at = $11
            WHERE id = $1 AND ($2::uuid IS NULL OR organization_id = $2)
            "#,
        )
        .bind(bridge.id.as_uuid())
        .bind(scope.organization_filter())
        .bind(bridge.state.as_str())
        .bind(&bridge.excluded_user_names)
        .bind(bridge.last_synced_at)
        .bind(bridge.next_sync_at)
        .bind(&bridge.sync_error)
        .bind(i64::from(bridge.consecutive_failures))
        .bind(i64::try_from(bridge.total_sync_count).unwrap_or(i64::MAX))
        .bind(i64::try_from(bridge.total_failure_count).unwrap_or(i64::MAX))
        .bind(bridge.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_scim_bridge", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(RESOURCE, bridge.id));
        }
        Ok(())
    }

    #[instrument(skip(self, tx), fields(bridge_id = %id), err)]
    async fn delete_scim_bridge(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        scope: &Scope,
        id: ScimBridgeId,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "DELETE FROM iam_scim_bridges
             WHERE id = $1 AND ($2::uuid IS NULL OR organization_id = $2)",
        )
        .bind(id.as_uuid())
        .bind(scope.organization_filter())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("delete_scim_bridge", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(RESOURCE, id));
        }
        Ok(())
    }
}

// SQLx row types

#[derive(Debug)]
struct ScimBridgeRow {
    id: uuid::Uuid,
    organization_id: uuid::Uuid,
    scim_configuration_id: uuid::Uuid,
    connector_id: uuid::Uuid,
    bridge_type: String,
    state: String,
    excluded_user_names: Vec<String>,
    last_synced_at: Option<DateTime<Utc>>,
    next_sync_at: Option<DateTime<Utc>>,
    sync_error: Option<String>,
    consecutive_failures: i64,
    total_sync_count: i64,
    total_failure_count: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ScimBridgeRow {
    fn from_pg_row(row: &sqlx::postgres::PgRow) -> StoreResult<Self> {
        let decode = |e: sqlx::Error| StoreError::decode(RESOURCE, e);
        Ok(ScimBridgeRow {
            id: row.try_get("id").map_err(decode)?,
            organization_id: row.try_get("organization_id").map_err(decode)?,
            scim_configuration_id: row.try_get("scim_configuration_id").map_err(decode)?,
            connector_id: row.try_get("connector_id").map_err(decode)?,
            bridge_type: row.try_get("type").map_err(decode)?,
            state: row.try_get("state").map_err(decode)?,
            excluded_user_names: row.try_get("excluded_user_names").map_err(decode)?,
            last_synced_at: row.try_get("last_synced_at").map_err(decode)?,
            next_sync_at: row.try_get("next_sync_at").map_err(decode)?,
            sync_error: row.try_get("sync_error").map_err(decode)?,
            consecutive_failures: row.try_get("consecutive_failures").map_err(decode)?,
            total_sync_count: row.try_get("total_sync_count").map_err(decode)?,
            total_failure_count: row.try_get("total_failure_count").map_err(decode)?,
            created_at: row.try_get("created_at").map_err(decode)?,
            updated_at: row.try_get("updated_at").map_err(decode)?,
        })
    }
}

impl TryFrom<ScimBridgeRow> for ScimBridge {
    type Error = StoreError;

    fn try_from(row: ScimBridgeRow) -> Result<Self, Self::Error> {
        let bridge_type: ScimBridgeType = row
            .bridge_type
            .parse()
            .map_err(|e| StoreError::decode(RESOURCE, e))?;
        let state: ScimBridgeState = row
            .state
            .parse()
            .map_err(|e| StoreError::decode(RESOURCE, e))?;
        let consecutive_failures = u32::try_from(row.consecutive_failures).map_err(|_| {
            StoreError::decode(
                RESOURCE,
                format!("consecutive_failures out of range: {}", row.consecutive_failures),
            )
        })?;

        Ok(ScimBridge {
            id: ScimBridgeId::from_uuid(row.id),
            organization_id: OrganizationId::from_uuid(row.organization_id),
            scim_configuration_id: ScimConfigurationId::from_uuid(row.scim_configuration_id),
            connector_id: ConnectorId::from_uuid(row.connector_id),
            bridge_type,
            state,
            excluded_user_names: row.excluded_user_names,
            last_synced_at: row.last_synced_at,
            next_sync_at: row.next_sync_at,
            sync_error: row.sync_error,
            consecutive_failures,
            total_sync_count: counter(RESOURCE, row.total_sync_count)?,
            total_failure_count: counter(RESOURCE, row.total_failure_count)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
