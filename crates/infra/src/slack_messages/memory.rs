//! In-memory Slack message persistence.

use chrono::{DateTime, Utc};

use dispatch_core::{SlackMessageId, Scope};

use super::{SlackMessage, SlackMessageStore, SlackMessageType};
use crate::store::memory::{RowKey, TxState};
use crate::store::{InMemoryStore, MemoryTx, StoreError, StoreResult};

const RESOURCE: &str = "slack message";

impl InMemoryStore {
    /// Committed Slack messages, for inspection in tests.
    pub fn slack_messages(&self) -> Vec<SlackMessage> {
        self.committed_rows()
    }
}

fn scoped(state: &TxState<'_>, scope: &Scope, id: SlackMessageId) -> StoreResult<SlackMessage> {
    state
        .row::<SlackMessage>(id)
        .filter(|message| scope.contains(message.organization_id))
        .ok_or(StoreError::SlackMessageNotFound(id))
}

fn lock(state: &mut TxState<'_>, id: SlackMessageId) -> StoreResult<()> {
    if state.try_lock(RowKey::SlackMessage(id)) {
        Ok(())
    } else {
        Err(StoreError::RowLocked {
            resource: RESOURCE,
            id: id.to_string(),
        })
    }
}

/// Oldest pending message matching `eligible` that no other transaction holds.
fn claim(
    state: &mut TxState<'_>,
    eligible: impl Fn(&TxState<'_>, &SlackMessage) -> bool,
) -> StoreResult<SlackMessage> {
    let mut pending: Vec<SlackMessage> = state
        .rows::<SlackMessage>()
        .into_iter()
        .filter(|message| message.is_pending() && eligible(&*state, message))
        .collect();
    pending.sort_by_key(|message| (message.created_at, message.id));

    pending
        .into_iter()
        .find(|message| state.try_lock(RowKey::SlackMessage(message.id)))
        .ok_or(StoreError::NoUnsentSlackMessage)
}

#[async_trait::async_trait]
impl SlackMessageStore for InMemoryStore {
    async fn insert_slack_message(
        &self,
        tx: &mut MemoryTx,
        message: &SlackMessage,
    ) -> StoreResult<()> {
        let mut state = tx.state();
        if state.row::<SlackMessage>(message.id).is_some() {
            return Err(StoreError::already_exists(RESOURCE, message.id.to_string()));
        }
        state.try_lock(RowKey::SlackMessage(message.id));
        state.put(message.clone());
        Ok(())
    }

    async fn load_slack_message(
        &self,
        tx: &mut MemoryTx,
        scope: &Scope,
        id: SlackMessageId,
    ) -> StoreResult<SlackMessage> {
        scoped(&tx.state(), scope, id)
    }

    async fn lock_slack_message(
        &self,
        tx: &mut MemoryTx,
        scope: &Scope,
        id: SlackMessageId,
    ) -> StoreResult<SlackMessage> {
        let mut state = tx.state();
        let message = scoped(&state, scope, id)?;
        lock(&mut state, id)?;
        Ok(message)
    }

    async fn claim_next_unsent_slack_message(
        &self,
        tx: &mut MemoryTx,
    ) -> StoreResult<SlackMessage> {
        claim(&mut tx.state(), |_, _| true)
    }

    async fn claim_next_initial_unsent_slack_message(
        &self,
        tx: &mut MemoryTx,
    ) -> StoreResult<SlackMessage> {
        claim(&mut tx.state(), |_, message| message.is_initial())
    }

    async fn claim_next_update_unsent_slack_message(
        &self,
        tx: &mut MemoryTx,
    ) -> StoreResult<SlackMessage> {
        claim(&mut tx.state(), |state, message| {
            !message.is_initial()
                && state
                    .row::<SlackMessage>(message.initial_slack_message_id)
                    .is_some_and(|initial| initial.is_sent())
        })
    }

    async fn update_slack_message(
        &self,
        tx: &mut MemoryTx,
        scope: &Scope,
        message: &SlackMessage,
    ) -> StoreResult<()> {
        let mut state = tx.state();
        let current = scoped(&state, scope, message.id)?;
        lock(&mut state, message.id)?;

        state.put(SlackMessage {
            message_ts: message.message_ts.clone(),
            channel_id: message.channel_id.clone(),
            sent_at: message.sent_at,
            error: message.error.clone(),
            updated_at: message.updated_at,
            ..current
        });
        Ok(())
    }

    async fn load_initial_slack_message_by_channel_and_ts(
        &self,
        tx: &mut MemoryTx,
        scope: &Scope,
        channel_id: &str,
        message_ts: &str,
    ) -> StoreResult<SlackMessage> {
        tx.state()
            .rows::<SlackMessage>()
            .into_iter()
            .find(|message| {
                message.is_initial()
                    && scope.contains(message.organization_id)
                    && message.channel_id.as_deref() == Some(channel_id)
                    && message.message_ts.as_deref() == Some(message_ts)
            })
            .ok_or_else(|| StoreError::slack_thread_not_found(channel_id, message_ts))
    }

    async fn load_latest_slack_message_by_requester_email_and_type(
        &self,
        tx: &mut MemoryTx,
        scope: &Scope,
        requester_email: &str,
        message_type: SlackMessageType,
        since: DateTime<Utc>,
    ) -> StoreResult<Option<SlackMessage>> {
        Ok(tx
            .state()
            .rows::<SlackMessage>()
            .into_iter()
            .filter(|message| {
                scope.contains(message.organization_id)
                    && message.message_type == message_type
                    && message.requester_email.as_deref() == Some(requester_email)
                    && message.created_at >= since
            })
            .max_by_key(|message| (message.created_at, message.id)))
    }

    async fn update_channel_and_ts_by_initial_message_id(
        &self,
        tx: &mut MemoryTx,
        scope: &Scope,
        initial_id: SlackMessageId,
        channel_id: &str,
        message_ts: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut state = tx.state();
        let replies: Vec<SlackMessage> = state
            .rows::<SlackMessage>()
            .into_iter()
            .filter(|message| {
                message.initial_slack_message_id == initial_id
                    && message.id != initial_id
                    && scope.contains(message.organization_id)
            })
            .collect();

        let mut updated = 0;
        for reply in replies {
            lock(&mut state, reply.id)?;
            state.put(SlackMessage {
                channel_id: Some(channel_id.to_string()),
                message_ts: Some(message_ts.to_string()),
                updated_at: now,
                ..reply
            });
            updated += 1;
        }
        Ok(updated)
    }
}
