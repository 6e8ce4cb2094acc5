//! Postgres export job persistence (`export_jobs` table).

use chrono::{DateTime, Utc};
use sqlx::{Postgres, Row, Transaction};
use tracing::instrument;

use dispatch_core::{ExportJobId, FileId, OrganizationId, Scope};

use super::{ExportArguments, ExportJob, ExportJobStatus, ExportJobStore, ExportJobType};
use crate::store::postgres::{is_unique_violation, map_sqlx_error};
use crate::store::{PgStore, StoreError, StoreResult};

const RESOURCE: &str = "export job";

const COLUMNS: &str = r#"
    id,
    organization_id,
    type,
    arguments,
    status,
    error,
    file_id,
    recipient_email,
    recipient_name,
    created_at,
    started_at,
    completed_at
"#;

#[async_trait::async_trait]
impl ExportJobStore for PgStore {
    #[instrument(
        skip(self, tx, job),
        fields(job_id = %job.id, organization_id = %job.organization_id),
        err
    )]
    async fn insert_export_job(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        job: &ExportJob,
    ) -> StoreResult<()> {
        let arguments = job.arguments.to_json()?;

        sqlx::query(
            r#"
            INSERT INTO export_jobs (
                id,
                organization_id,
                type,
                arguments,
                status,
                error,
                file_id,
                recipient_email,
                recipient_name,
                created_at,
                started_at,
                completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.organization_id.as_uuid())
        .bind(job.job_type().as_str())
        .bind(&arguments)
        .bind(job.status.as_str())
        .bind(&job.error)
        .bind(job.file_id.map(uuid::Uuid::from))
        .bind(&job.recipient_email)
        .bind(&job.recipient_name)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::already_exists(RESOURCE, job.id.to_string())
            } else {
                map_sqlx_error("insert_export_job", e)
            }
        })?;

        Ok(())
    }

    #[instrument(skip(self, tx), fields(job_id = %id), err)]
    async fn load_export_job(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        scope: &Scope,
        id: ExportJobId,
    ) -> StoreResult<ExportJob> {
        let query = format!(
            "SELECT {COLUMNS} FROM export_jobs
             WHERE id = $1 AND ($2::uuid IS NULL OR organization_id = $2)"
        );

        let row = sqlx::query(&query)
            .bind(id.as_uuid())
            .bind(scope.organization_filter())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("load_export_job", e))?;

        match row {
            Some(row) => ExportJobRow::from_pg_row(&row)?.try_into(),
            None => Err(StoreError::not_found(RESOURCE, id)),
        }
    }

    #[instrument(skip(self, tx))]
    async fn claim_next_pending_export_job(
        &self,
        tx: &mut Transaction<'static, Postgres>,
    ) -> StoreResult<ExportJob> {
        let query = format!(
            "SELECT {COLUMNS} FROM export_jobs
             WHERE status = $1
             ORDER BY created_at ASC, id ASC
             LIMIT 1
             FOR UPDATE SKIP LOCKED"
        );

        let row = sqlx::query(&query)
            .bind(ExportJobStatus::Pending.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("claim_next_pending_export_job", e))?;

        match row {
            Some(row) => ExportJobRow::from_pg_row(&row)?.try_into(),
            None => Err(StoreError::NoExportJobAvailable),
        }
    }

    #[instrument(skip(self, tx, job), fields(job_id = %job.id, status = job.status.as_str()), err)]
    async fn update_export_job(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        scope: &Scope,
        job: &ExportJob,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE export_jobs
            SET
                status = $3,
                error = $4,
                file_id = $5,
                started_at = $6,
                completed_at = $7
            WHERE id = $1 AND ($2::uuid IS NULL OR organization_id = $2)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(scope.organization_filter())
        .bind(job.status.as_str())
        .bind(&job.error)
        .bind(job.file_id.map(uuid::Uuid::from))
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_export_job", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(RESOURCE, job.id));
        }
        Ok(())
    }
}

// SQLx row types

#[derive(Debug)]
struct ExportJobRow {
    id: uuid::Uuid,
    organization_id: uuid::Uuid,
    job_type: String,
    arguments: serde_json::Value,
    status: String,
    error: Option<String>,
    file_id: Option<uuid::Uuid>,
    recipient_email: String,
    recipient_name: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl ExportJobRow {
    fn from_pg_row(row: &sqlx::postgres::PgRow) -> StoreResult<Self> {
        let decode = |e: sqlx::Error| StoreError::decode(RESOURCE, e);
        Ok(ExportJobRow {
            id: row.try_get("id").map_err(decode)?,
            organization_id: row.try_get("organization_id").map_err(decode)?,
            job_type: row.try_get("type").map_err(decode)?,
            arguments: row.try_get("arguments").map_err(decode)?,
            status: row.try_get("status").map_err(decode)?,
            error: row.try_get("error").map_err(decode)?,
            file_id: row.try_get("file_id").map_err(decode)?,
            recipient_email: row.try_get("recipient_email").map_err(decode)?,
            recipient_name: row.try_get("recipient_name").map_err(decode)?,
            created_at: row.try_get("created_at").map_err(decode)?,
            started_at: row.try_get("started_at").map_err(decode)?,
            completed_at: row.try_get("completed_at").map_err(decode)?,
        })
    }
}

impl TryFrom<ExportJobRow> for ExportJob {
    type Error = StoreError;

    fn try_from(row: ExportJobRow) -> Result<Self, Self::Error> {
        let job_type: ExportJobType = row
            .job_type
            .parse()
            .map_err(|e| StoreError::decode(RESOURCE, e))?;
        let status: ExportJobStatus = row
            .status
            .parse()
            .map_err(|e| StoreError::decode(RESOURCE, e))?;
        let arguments = ExportArguments::from_json(job_type, row.arguments)
            .map_err(|e| StoreError::decode(RESOURCE, e))?;

        Ok(ExportJob {
            id: ExportJobId::from_uuid(row.id),
            organization_id: OrganizationId::from_uuid(row.organization_id),
            arguments,
            status,
            error: row.error,
            file_id: row.file_id.map(FileId::from_uuid),
            recipient_email: row.recipient_email,
            recipient_name: row.recipient_name,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}
