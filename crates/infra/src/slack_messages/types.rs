//! Outbound Slack message records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dispatch_core::{DomainError, DomainResult, OrganizationId, SlackMessageId};

/// Logical event a message announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlackMessageType {
    TrustCenterAccessRequest,
    TrustCenterDocumentAccessRequest,
}

impl SlackMessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlackMessageType::TrustCenterAccessRequest => "TRUST_CENTER_ACCESS_REQUEST",
            SlackMessageType::TrustCenterDocumentAccessRequest => {
                "TRUST_CENTER_DOCUMENT_ACCESS_REQUEST"
            }
        }
    }
}

impl core::str::FromStr for SlackMessageType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRUST_CENTER_ACCESS_REQUEST" => Ok(Self::TrustCenterAccessRequest),
            "TRUST_CENTER_DOCUMENT_ACCESS_REQUEST" => Ok(Self::TrustCenterDocumentAccessRequest),
            other => Err(DomainError::validation(format!(
                "unknown slack message type: {other}"
            ))),
        }
    }
}

/// Where a message sits in its thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadPosition {
    /// Opens a new thread.
    Root,
    /// Threaded update; deliverable only once `initial_id` has been sent.
    Reply { initial_id: SlackMessageId },
}

/// Delivery state derived from the terminal markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

/// Request to record an outbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSlackMessage {
    pub id: SlackMessageId,
    pub organization_id: OrganizationId,
    pub message_type: SlackMessageType,
    pub body: serde_json::Value,
    pub requester_email: Option<String>,
    pub metadata: serde_json::Value,
    pub thread: ThreadPosition,
}

impl NewSlackMessage {
    pub fn new(
        organization_id: OrganizationId,
        message_type: SlackMessageType,
        body: serde_json::Value,
    ) -> Self {
        Self {
            id: SlackMessageId::new(),
            organization_id,
            message_type,
            body,
            requester_email: None,
            metadata: serde_json::Value::Object(Default::default()),
            thread: ThreadPosition::Root,
        }
    }

    pub fn with_requester_email(mut self, email: impl Into<String>) -> Self {
        self.requester_email = Some(email.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Post as a threaded reply under `initial_id`.
    pub fn in_reply_to(mut self, initial_id: SlackMessageId) -> Self {
        self.thread = ThreadPosition::Reply { initial_id };
        self
    }

    /// Materialize a pending row.
    ///
    /// `location` is the `(channel_id, message_ts)` of an already-sent initial.
    pub fn into_message(
        self,
        location: Option<(String, String)>,
        now: DateTime<Utc>,
    ) -> SlackMessage {
        let initial_slack_message_id = match self.thread {
            ThreadPosition::Root => self.id,
            ThreadPosition::Reply { initial_id } => initial_id,
        };
        let (channel_id, message_ts) = match location {
            Some((channel_id, message_ts)) => (Some(channel_id), Some(message_ts)),
            None => (None, None),
        };

        SlackMessage {
            id: self.id,
            organization_id: self.organization_id,
            message_type: self.message_type,
            body: self.body,
            message_ts,
            channel_id,
            requester_email: self.requester_email,
            metadata: self.metadata,
            initial_slack_message_id,
            created_at: now,
            updated_at: now,
            sent_at: None,
            error: None,
        }
    }
}

/// One row of the outbox log.
///
/// `sent_at` and `error` are mutually exclusive; both `None` means pending.
#[derive(Debug, Clone, PartialEq)]
pub struct SlackMessage {
    pub id: SlackMessageId,
    pub organization_id: OrganizationId,
    pub message_type: SlackMessageType,
    pub body: serde_json::Value,
    pub message_ts: Option<String>,
    pub channel_id: Option<String>,
    pub requester_email: Option<String>,
    pub metadata: serde_json::Value,
    /// Equals `id` for the thread's opening message.
    pub initial_slack_message_id: SlackMessageId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl SlackMessage {
    pub fn is_initial(&self) -> bool {
        self.id == self.initial_slack_message_id
    }

    pub fn thread(&self) -> ThreadPosition {
        if self.is_initial() {
            ThreadPosition::Root
        } else {
            ThreadPosition::Reply {
                initial_id: self.initial_slack_message_id,
            }
        }
    }

    pub fn status(&self) -> DeliveryStatus {
        match (self.sent_at, &self.error) {
            (_, Some(_)) => DeliveryStatus::Failed,
            (Some(_), None) => DeliveryStatus::Sent,
            (None, None) => DeliveryStatus::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status() == DeliveryStatus::Pending
    }

    /// Whether the message was delivered without error.
    pub fn is_sent(&self) -> bool {
        self.status() == DeliveryStatus::Sent
    }

    pub fn mark_sent(
        &mut self,
        message_ts: impl Into<String>,
        channel_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_pending()?;
        self.message_ts = Some(message_ts.into());
        self.channel_id = Some(channel_id.into());
        self.sent_at = Some(now);
        self.error = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_pending()?;
        self.error = Some(error.into());
        self.sent_at = None;
        self.updated_at = now;
        Ok(())
    }

    fn ensure_pending(&self) -> DomainResult<()> {
        match self.status() {
            DeliveryStatus::Pending => Ok(()),
            DeliveryStatus::Sent => Err(DomainError::invalid_transition(format!(
                "slack message {} was already sent",
                self.id
            ))),
            DeliveryStatus::Failed => Err(DomainError::invalid_transition(format!(
                "slack message {} already failed",
                self.id
            ))),
        }
    }
}
