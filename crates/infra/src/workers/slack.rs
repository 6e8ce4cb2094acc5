//! Slack outbox driver.

use tracing::{Instrument, debug, info_span};

use dispatch_core::SlackMessageId;

use super::{PollConfig, PollingWorker, catch_failure};
use crate::slack_messages::{OutboxRelay, SlackMessage, SlackMessageStore};
use crate::store::{Store, StoreError, StoreResult};

/// Where Slack put a delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedMessage {
    pub channel_id: String,
    pub message_ts: String,
}

/// Posts one message to Slack.
///
/// For a reply, `channel_id`/`message_ts` on the message carry the thread's
/// location.
#[async_trait::async_trait]
pub trait SlackSender: Send + Sync {
    async fn send(&self, message: &SlackMessage) -> anyhow::Result<PostedMessage>;
}

/// Delivers pending messages, opening threads before replying in them.
#[derive(Debug)]
pub struct SlackRelayWorker<S, C> {
    relay: OutboxRelay<S>,
    sender: C,
    poll: PollConfig,
}

impl<S: SlackMessageStore, C: SlackSender> SlackRelayWorker<S, C> {
    pub fn new(relay: OutboxRelay<S>, sender: C, poll: PollConfig) -> Self {
        Self {
            relay,
            sender,
            poll,
        }
    }

    /// Initial messages first, then updates whose thread exists.
    async fn claim(&self, tx: &mut S::Tx) -> StoreResult<Option<SlackMessage>> {
        match self.relay.claim_next_initial_unsent(tx).await {
            Ok(message) => return Ok(Some(message)),
            Err(err) if err.is_empty_queue() => {}
            Err(err) => return Err(err),
        }
        match self.relay.claim_next_update_unsent(tx).await {
            Ok(message) => Ok(Some(message)),
            Err(err) if err.is_empty_queue() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[async_trait::async_trait]
impl<S, C> PollingWorker for SlackRelayWorker<S, C>
where
    S: SlackMessageStore,
    C: SlackSender,
{
    type Id = SlackMessageId;

    fn name(&self) -> &'static str {
        "slack_messages"
    }

    fn poll_config(&self) -> &PollConfig {
        &self.poll
    }

    async fn run_next(&self) -> StoreResult<Option<SlackMessageId>> {
        let store = self.relay.store();
        let mut tx = store.begin().await?;

        let Some(mut message) = self.claim(&mut tx).await? else {
            store.rollback(tx).await?;
            return Ok(None);
        };

        let span = info_span!(
            "slack_message",
            message.id = %message.id,
            message.initial = message.is_initial()
        );
        async move {
            debug!("sending slack message");
            match catch_failure(self.sender.send(&message)).await {
                Ok(posted) => {
                    self.relay
                        .mark_sent(&mut tx, &mut message, &posted.message_ts, &posted.channel_id)
                        .await?
                }
                Err(error) => self.relay.mark_failed(&mut tx, &mut message, &error).await?,
            }
            store.commit(tx).await?;
            Ok::<_, StoreError>(Some(message.id))
        }
        .instrument(span)
        .await
    }
}
