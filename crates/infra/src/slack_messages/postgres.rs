//! Postgres Slack message persistence (`slack_messages` table).

use chrono::{DateTime, Utc};
use sqlx::{Postgres, Row, Transaction};
use tracing::instrument;

use dispatch_core::{OrganizationId, SlackMessageId, Scope};

use super::{SlackMessage, SlackMessageStore, SlackMessageType};
use crate::store::postgres::{is_unique_violation, map_sqlx_error};
use crate::store::{PgStore, StoreError, StoreResult};

const RESOURCE: &str = "slack message";

const COLUMNS: &str = r#"
    m.id,
    m.organization_id,
    m.type,
    m.body,
    m.message_ts,
    m.channel_id,
    m.requester_email,
    m.metadata,
    m.initial_slack_message_id,
    m.created_at,
    m.updated_at,
    m.sent_at,
    m.error
"#;

impl PgStore {
    async fn fetch_slack_message(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        operation: &'static str,
        query: &str,
    ) -> StoreResult<Option<SlackMessage>> {
        let row = sqlx::query(query)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        row.map(|row| SlackMessage::try_from(SlackMessageRow::from_pg_row(&row)?))
            .transpose()
    }

    async fn scoped_slack_message(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        operation: &'static str,
        scope: &Scope,
        id: SlackMessageId,
        lock: bool,
    ) -> StoreResult<SlackMessage> {
        let query = format!(
            "SELECT {COLUMNS} FROM slack_messages m
             WHERE m.id = $1 AND ($2::uuid IS NULL OR m.organization_id = $2)
             {}",
            if lock { "FOR UPDATE" } else { "" }
        );

        let row = sqlx::query(&query)
            .bind(id.as_uuid())
            .bind(scope.organization_filter())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        match row {
            Some(row) => SlackMessageRow::from_pg_row(&row)?.try_into(),
            None => Err(StoreError::SlackMessageNotFound(id)),
        }
    }
}

#[async_trait::async_trait]
impl SlackMessageStore for PgStore {
    #[instrument(
        skip(self, tx, message),
        fields(message_id = %message.id, organization_id = %message.organization_id),
        err
    )]
    async fn insert_slack_message(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        message: &SlackMessage,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO slack_messages (
                id,
                organization_id,
                type,
                body,
                message_ts,
                channel_id,
                requester_email,
                metadata,
                initial_slack_message_id,
                created_at,
                updated_at,
                sent_at,
                error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(message.id.as_uuid())
        .bind(message.organization_id.as_uuid())
        .bind(message.message_type.as_str())
        .bind(&message.body)
        .bind(&message.message_ts)
        .bind(&message.channel_id)
        .bind(&message.requester_email)
        .bind(&message.metadata)
        .bind(message.initial_slack_message_id.as_uuid())
        .bind(message.created_at)
        .bind(message.updated_at)
        .bind(message.sent_at)
        .bind(&message.error)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::already_exists(RESOURCE, message.id.to_string())
            } else {
                map_sqlx_error("insert_slack_message", e)
            }
        })?;

        Ok(())
    }

    #[instrument(skip(self, tx), fields(message_id = %id), err)]
    async fn load_slack_message(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        scope: &Scope,
        id: SlackMessageId,
    ) -> StoreResult<SlackMessage> {
        self.scoped_slack_message(tx, "load_slack_message", scope, id, false)
            .await
    }

    #[instrument(skip(self, tx), fields(message_id = %id), err)]
    async fn lock_slack_message(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        scope: &Scope,
        id: SlackMessageId,
    ) -> StoreResult<SlackMessage> {
        self.scoped_slack_message(tx, "lock_slack_message", scope, id, true)
            .await
    }

    #[instrument(skip(self, tx))]
    async fn claim_next_unsent_slack_message(
        &self,
        tx: &mut Transaction<'static, Postgres>,
    ) -> StoreResult<SlackMessage> {
        let query = format!(
            "SELECT {COLUMNS} FROM slack_messages m
             WHERE m.sent_at IS NULL AND m.error IS NULL
             ORDER BY m.created_at ASC, m.id ASC
             LIMIT 1
             FOR UPDATE SKIP LOCKED"
        );

        self.fetch_slack_message(tx, "claim_next_unsent_slack_message", &query)
            .await?
            .ok_or(StoreError::NoUnsentSlackMessage)
    }

    #[instrument(skip(self, tx))]
    async fn claim_next_initial_unsent_slack_message(
        &self,
        tx: &mut Transaction<'static, Postgres>,
    ) -> StoreResult<SlackMessage> {
        let query = format!(
            "SELECT {COLUMNS} FROM slack_messages m
             WHERE m.sent_at IS NULL AND m.error IS NULL
               AND m.id = m.initial_slack_message_id
             ORDER BY m.created_at ASC, m.id ASC
             LIMIT 1
             FOR UPDATE SKIP LOCKED"
        );

        self.fetch_slack_message(tx, "claim_next_initial_unsent_slack_message", &query)
            .await?
            .ok_or(StoreError::NoUnsentSlackMessage)
    }

    #[instrument(skip(self, tx))]
    async fn claim_next_update_unsent_slack_message(
        &self,
        tx: &mut Transaction<'static, Postgres>,
    ) -> StoreResult<SlackMessage> {
        let query = format!(
            "SELECT {COLUMNS} FROM slack_messages m
             INNER JOIN slack_messages p ON p.id = m.initial_slack_message_id
             WHERE m.sent_at IS NULL AND m.error IS NULL
               AND m.id <> m.initial_slack_message_id
               AND p.sent_at IS NOT NULL AND p.error IS NULL
             ORDER BY m.created_at ASC, m.id ASC
             LIMIT 1
             FOR UPDATE OF m SKIP LOCKED"
        );

        self.fetch_slack_message(tx, "claim_next_update_unsent_slack_message", &query)
            .await?
            .ok_or(StoreError::NoUnsentSlackMessage)
    }

    #[instrument(skip(self, tx, message), fields(message_id = %message.id), err)]
    async fn update_slack_message(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        scope: &Scope,
        message: &SlackMessage,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE slack_messages
            SET
                message_ts = $3,
                channel_id = $4,
                sent_at = $5,
                error = $6,
                updated_at = $7
            WHERE id = $1 AND ($2::uuid IS NULL OR organization_id = $2)
            "#,
        )
        .bind(message.id.as_uuid())
        .bind(scope.organization_filter())
        .bind(&message.message_ts)
        .bind(&message.channel_id)
        .bind(message.sent_at)
        .bind(&message.error)
        .bind(message.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_slack_message", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::SlackMessageNotFound(message.id));
        }
        Ok(())
    }

    #[instrument(skip(self, tx), err)]
    async fn load_initial_slack_message_by_channel_and_ts(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        scope: &Scope,
        channel_id: &str,
        message_ts: &str,
    ) -> StoreResult<SlackMessage> {
        let query = format!(
            "SELECT {COLUMNS} FROM slack_messages m
             WHERE m.channel_id = $1 AND m.message_ts = $2
               AND m.id = m.initial_slack_message_id
               AND ($3::uuid IS NULL OR m.organization_id = $3)
             LIMIT 1"
        );

        let row = sqlx::query(&query)
            .bind(channel_id)
            .bind(message_ts)
            .bind(scope.organization_filter())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("load_initial_slack_message_by_channel_and_ts", e))?;

        match row {
            Some(row) => SlackMessageRow::from_pg_row(&row)?.try_into(),
            None => Err(StoreError::slack_thread_not_found(channel_id, message_ts)),
        }
    }

    #[instrument(
        skip(self, tx, requester_email),
        fields(message_type = message_type.as_str()),
        err
    )]
    async fn load_latest_slack_message_by_requester_email_and_type(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        scope: &Scope,
        requester_email: &str,
        message_type: SlackMessageType,
        since: DateTime<Utc>,
    ) -> StoreResult<Option<SlackMessage>> {
        let query = format!(
            "SELECT {COLUMNS} FROM slack_messages m
             WHERE m.requester_email = $1 AND m.type = $2 AND m.created_at >= $3
               AND ($4::uuid IS NULL OR m.organization_id = $4)
             ORDER BY m.created_at DESC, m.id DESC
             LIMIT 1"
        );

        let row = sqlx::query(&query)
            .bind(requester_email)
            .bind(message_type.as_str())
            .bind(since)
            .bind(scope.organization_filter())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| {
                map_sqlx_error("load_latest_slack_message_by_requester_email_and_type", e)
            })?;

        row.map(|row| SlackMessage::try_from(SlackMessageRow::from_pg_row(&row)?))
            .transpose()
    }

    #[instrument(skip(self, tx), fields(initial_message_id = %initial_id), err)]
    async fn update_channel_and_ts_by_initial_message_id(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        scope: &Scope,
        initial_id: SlackMessageId,
        channel_id: &str,
        message_ts: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE slack_messages
            SET channel_id = $3, message_ts = $4, updated_at = $5
            WHERE initial_slack_message_id = $1
              AND id <> $1
              AND ($2::uuid IS NULL OR organization_id = $2)
            "#,
        )
        .bind(initial_id.as_uuid())
        .bind(scope.organization_filter())
        .bind(channel_id)
        .bind(message_ts)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_channel_and_ts_by_initial_message_id", e))?;

        Ok(result.rows_affected())
    }
}

// SQLx row types

#[derive(Debug)]
struct SlackMessageRow {
    id: uuid::Uuid,
    organization_id: uuid::Uuid,
    message_type: String,
    body: serde_json::Value,
    message_ts: Option<String>,
    channel_id: Option<String>,
    requester_email: Option<String>,
    metadata: serde_json::Value,
    initial_slack_message_id: uuid::Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl SlackMessageRow {
    fn from_pg_row(row: &sqlx::postgres::PgRow) -> StoreResult<Self> {
        let decode = |e: sqlx::Error| StoreError::decode(RESOURCE, e);
        Ok(SlackMessageRow {
            id: row.try_get("id").map_err(decode)?,
            organization_id: row.try_get("organization_id").map_err(decode)?,
            message_type: row.try_get("type").map_err(decode)?,
            body: row.try_get("body").map_err(decode)?,
            message_ts: row.try_get("message_ts").map_err(decode)?,
            channel_id: row.try_get("channel_id").map_err(decode)?,
            requester_email: row.try_get("requester_email").map_err(decode)?,
            metadata: row.try_get("metadata").map_err(decode)?,
            initial_slack_message_id: row.try_get("initial_slack_message_id").map_err(decode)?,
            created_at: row.try_get("created_at").map_err(decode)?,
            updated_at: row.try_get("updated_at").map_err(decode)?,
            sent_at: row.try_get("sent_at").map_err(decode)?,
            error: row.try_get("error").map_err(decode)?,
        })
    }
}

impl TryFrom<SlackMessageRow> for SlackMessage {
    type Error = StoreError;

    fn try_from(row: SlackMessageRow) -> Result<Self, Self::Error> {
        let message_type: SlackMessageType = row
            .message_type
            .parse()
            .map_err(|e| StoreError::decode(RESOURCE, e))?;

        Ok(SlackMessage {
            id: SlackMessageId::from_uuid(row.id),
            organization_id: OrganizationId::from_uuid(row.organization_id),
            message_type,
            body: row.body,
            message_ts: row.message_ts,
            channel_id: row.channel_id,
            requester_email: row.requester_email,
            metadata: row.metadata,
            initial_slack_message_id: SlackMessageId::from_uuid(row.initial_slack_message_id),
            created_at: row.created_at,
            updated_at: row.updated_at,
            sent_at: row.sent_at,
            error: row.error,
        })
    }
}
