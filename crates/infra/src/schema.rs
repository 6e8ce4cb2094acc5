//! Postgres schema for the three queue tables.
//!
//! Statements are idempotent, so [`apply`] can run on every worker start.

use sqlx::PgPool;
use tracing::{debug, instrument};

use crate::store::postgres::map_sqlx_error;
use crate::store::StoreResult;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS export_jobs (
        id              UUID PRIMARY KEY,
        organization_id UUID NOT NULL,
        type            TEXT NOT NULL,
        arguments       JSONB NOT NULL,
        status          TEXT NOT NULL,
        error           TEXT NULL,
        file_id         UUID NULL,
        recipient_email TEXT NOT NULL,
        recipient_name  TEXT NOT NULL,
        created_at      TIMESTAMPTZ NOT NULL,
        started_at      TIMESTAMPTZ NULL,
        completed_at    TIMESTAMPTZ NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS export_jobs_pending_idx
        ON export_jobs (created_at, id)
        WHERE status = 'PENDING'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS export_jobs_organization_idx
        ON export_jobs (organization_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS iam_scim_bridges (
        id                    UUID PRIMARY KEY,
        organization_id       UUID NOT NULL,
        scim_configuration_id UUID NOT NULL UNIQUE,
        connector_id          UUID NOT NULL,
        type                  TEXT NOT NULL,
        state                 TEXT NOT NULL,
        excluded_user_names   TEXT[] NOT NULL DEFAULT '{}',
        last_synced_at        TIMESTAMPTZ NULL,
        next_sync_at          TIMESTAMPTZ NULL,
        sync_error            TEXT NULL,
        consecutive_failures  BIGINT NOT NULL DEFAULT 0,
        total_sync_count      BIGINT NOT NULL DEFAULT 0,
        total_failure_count   BIGINT NOT NULL DEFAULT 0,
        created_at            TIMESTAMPTZ NOT NULL,
        updated_at            TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS iam_scim_bridges_due_idx
        ON iam_scim_bridges (next_sync_at NULLS FIRST, created_at, id)
        WHERE state IN ('ACTIVE', 'FAILED')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS iam_scim_bridges_syncing_idx
        ON iam_scim_bridges (updated_at)
        WHERE state = 'SYNCING'
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS slack_messages (
        id                       UUID PRIMARY KEY,
        organization_id          UUID NOT NULL,
        type                     TEXT NOT NULL,
        body                     JSONB NOT NULL,
        message_ts               TEXT NULL,
        channel_id               TEXT NULL,
        requester_email          TEXT NULL,
        metadata                 JSONB NOT NULL DEFAULT '{}',
        initial_slack_message_id UUID NOT NULL REFERENCES slack_messages (id),
        created_at               TIMESTAMPTZ NOT NULL,
        updated_at               TIMESTAMPTZ NOT NULL,
        sent_at                  TIMESTAMPTZ NULL,
        error                    TEXT NULL,
        CONSTRAINT slack_messages_single_terminal_state
            CHECK (sent_at IS NULL OR error IS NULL)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS slack_messages_unsent_idx
        ON slack_messages (created_at, id)
        WHERE sent_at IS NULL AND error IS NULL
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS slack_messages_initial_idx
        ON slack_messages (initial_slack_message_id)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS slack_messages_location_idx
        ON slack_messages (channel_id, message_ts)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS slack_messages_requester_idx
        ON slack_messages (requester_email, type, created_at DESC)
    "#,
];

/// Create missing tables and indexes.
#[instrument(skip(pool), err)]
pub async fn apply(pool: &PgPool) -> StoreResult<()> {
    for statement in STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("apply_schema", e))?;
    }
    debug!(statements = STATEMENTS.len(), "dispatch schema applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created_tables() -> Vec<&'static str> {
        STATEMENTS
            .iter()
            .filter_map(|statement| {
                statement
                    .trim()
                    .strip_prefix("CREATE TABLE IF NOT EXISTS ")
                    .and_then(|rest| rest.split_whitespace().next())
            })
            .collect()
    }

    #[test]
    fn creates_the_shared_platform_tables() {
        assert_eq!(
            created_tables(),
            vec!["export_jobs", "iam_scim_bridges", "slack_messages"]
        );
    }

    #[test]
    fn every_statement_is_idempotent() {
        for statement in STATEMENTS {
            assert!(statement.contains("IF NOT EXISTS"), "{statement}");
        }
    }
}
