//! Slack outbox relay.
//!
//! Append-only log of outbound messages. A thread's opening ("initial")
//! message references itself through `initial_slack_message_id`; threaded
//! updates reference the initial. An update only becomes claimable once its
//! initial was delivered, which is enforced by the claim predicate.
//!
//! Delivery is attempted once: `error` is a permanent record and nothing here
//! re-queues a failed message.

pub mod memory;
pub mod postgres;
pub mod types;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use dispatch_core::{SlackMessageId, Scope};

use crate::store::{Store, StoreError, StoreResult};

pub use types::{DeliveryStatus, NewSlackMessage, SlackMessage, SlackMessageType, ThreadPosition};

/// Persistence for outbound Slack messages.
#[async_trait::async_trait]
pub trait SlackMessageStore: Store {
    async fn insert_slack_message(
        &self,
        tx: &mut Self::Tx,
        message: &SlackMessage,
    ) -> StoreResult<()>;

    /// Load a message visible in `scope`; `SlackMessageNotFound` otherwise.
    async fn load_slack_message(
        &self,
        tx: &mut Self::Tx,
        scope: &Scope,
        id: SlackMessageId,
    ) -> StoreResult<SlackMessage>;

    /// Load and row-lock a message for the rest of the transaction.
    async fn lock_slack_message(
        &self,
        tx: &mut Self::Tx,
        scope: &Scope,
        id: SlackMessageId,
    ) -> StoreResult<SlackMessage>;

    /// Claim the oldest pending message of any kind.
    async fn claim_next_unsent_slack_message(&self, tx: &mut Self::Tx)
    -> StoreResult<SlackMessage>;

    /// Claim the oldest pending thread-opening message.
    async fn claim_next_initial_unsent_slack_message(
        &self,
        tx: &mut Self::Tx,
    ) -> StoreResult<SlackMessage>;

    /// Claim the oldest pending update whose initial was delivered.
    async fn claim_next_update_unsent_slack_message(
        &self,
        tx: &mut Self::Tx,
    ) -> StoreResult<SlackMessage>;

    /// Persist the delivery fields of `message`.
    async fn update_slack_message(
        &self,
        tx: &mut Self::Tx,
        scope: &Scope,
        message: &SlackMessage,
    ) -> StoreResult<()>;

    async fn load_initial_slack_message_by_channel_and_ts(
        &self,
        tx: &mut Self::Tx,
        scope: &Scope,
        channel_id: &str,
        message_ts: &str,
    ) -> StoreResult<SlackMessage>;

    /// Most recent message of `message_type` for `requester_email` created at
    /// or after `since`.
    async fn load_latest_slack_message_by_requester_email_and_type(
        &self,
        tx: &mut Self::Tx,
        scope: &Scope,
        requester_email: &str,
        message_type: SlackMessageType,
        since: DateTime<Utc>,
    ) -> StoreResult<Option<SlackMessage>>;

    /// Copy the thread location onto every update of `initial_id`.
    ///
    /// Returns the number of updated rows.
    async fn update_channel_and_ts_by_initial_message_id(
        &self,
        tx: &mut Self::Tx,
        scope: &Scope,
        initial_id: SlackMessageId,
        channel_id: &str,
        message_ts: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64>;
}

/// Slack outbox manager.
#[derive(Debug, Clone)]
pub struct OutboxRelay<S> {
    store: S,
}

impl<S: SlackMessageStore> OutboxRelay<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Record a pending message.
    ///
    /// A reply's initial must exist in the same organization. Replies to an
    /// already-delivered initial inherit its channel and timestamp.
    pub async fn enqueue(
        &self,
        tx: &mut S::Tx,
        scope: &Scope,
        message: NewSlackMessage,
    ) -> StoreResult<SlackMessage> {
        if !scope.contains(message.organization_id) {
            return Err(StoreError::not_found("organization", message.organization_id));
        }

        let location = match message.thread {
            ThreadPosition::Root => None,
            ThreadPosition::Reply { initial_id } => {
                let owner = Scope::organization(message.organization_id);
                let initial = self.store.load_slack_message(tx, &owner, initial_id).await?;
                if !initial.is_initial() {
                    return Err(StoreError::InvalidTransition(format!(
                        "slack message {initial_id} is itself a reply"
                    )));
                }
                match (initial.is_sent(), initial.channel_id, initial.message_ts) {
                    (true, Some(channel_id), Some(message_ts)) => Some((channel_id, message_ts)),
                    _ => None,
                }
            }
        };

        let message = message.into_message(location, Utc::now());
        self.store.insert_slack_message(tx, &message).await?;
        debug!(
            message_id = %message.id,
            initial_message_id = %message.initial_slack_message_id,
            message_type = message.message_type.as_str(),
            "slack message enqueued"
        );
        Ok(message)
    }

    pub async fn claim_next_unsent(&self, tx: &mut S::Tx) -> StoreResult<SlackMessage> {
        self.store.claim_next_unsent_slack_message(tx).await
    }

    pub async fn claim_next_initial_unsent(&self, tx: &mut S::Tx) -> StoreResult<SlackMessage> {
        self.store.claim_next_initial_unsent_slack_message(tx).await
    }

    pub async fn claim_next_update_unsent(&self, tx: &mut S::Tx) -> StoreResult<SlackMessage> {
        self.store.claim_next_update_unsent_slack_message(tx).await
    }

    /// Record delivery. For an initial message the location is back-filled
    /// onto its existing updates.
    pub async fn mark_sent(
        &self,
        tx: &mut S::Tx,
        message: &mut SlackMessage,
        message_ts: &str,
        channel_id: &str,
    ) -> StoreResult<()> {
        let scope = Scope::organization(message.organization_id);
        let mut current = self.store.lock_slack_message(tx, &scope, message.id).await?;
        let now = Utc::now();
        current.mark_sent(message_ts, channel_id, now)?;
        self.store.update_slack_message(tx, &scope, &current).await?;

        if current.is_initial() {
            let updated = self
                .store
                .update_channel_and_ts_by_initial_message_id(
                    tx, &scope, current.id, channel_id, message_ts, now,
                )
                .await?;
            debug!(message_id = %current.id, replies = updated, "thread location back-filled");
        }

        *message = current;
        Ok(())
    }

    /// Record a permanent delivery failure.
    pub async fn mark_failed(
        &self,
        tx: &mut S::Tx,
        message: &mut SlackMessage,
        error: &str,
    ) -> StoreResult<()> {
        let scope = Scope::organization(message.organization_id);
        let mut current = self.store.lock_slack_message(tx, &scope, message.id).await?;
        current.mark_failed(error, Utc::now())?;
        self.store.update_slack_message(tx, &scope, &current).await?;
        warn!(message_id = %current.id, error, "slack message delivery failed");

        *message = current;
        Ok(())
    }

    pub async fn load_by_id(
        &self,
        tx: &mut S::Tx,
        scope: &Scope,
        id: SlackMessageId,
    ) -> StoreResult<SlackMessage> {
        self.store.load_slack_message(tx, scope, id).await
    }

    pub async fn load_initial_by_channel_and_ts(
        &self,
        tx: &mut S::Tx,
        scope: &Scope,
        channel_id: &str,
        message_ts: &str,
    ) -> StoreResult<SlackMessage> {
        self.store
            .load_initial_slack_message_by_channel_and_ts(tx, scope, channel_id, message_ts)
            .await
    }

    /// Dedupe lookup: latest message for the requester and type since `since`.
    pub async fn load_latest_by_requester_email_and_type(
        &self,
        tx: &mut S::Tx,
        scope: &Scope,
        requester_email: &str,
        message_type: SlackMessageType,
        since: DateTime<Utc>,
    ) -> StoreResult<Option<SlackMessage>> {
        self.store
            .load_latest_slack_message_by_requester_email_and_type(
                tx,
                scope,
                requester_email,
                message_type,
                since,
            )
            .await
    }
}
