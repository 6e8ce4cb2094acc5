//! Storage error taxonomy shared by the three queue managers.

use dispatch_core::{DomainError, SlackMessageId};

/// Store error.
///
/// The three `No*` variants are the normal "nothing to do" signal of a claim
/// query and are never logged as errors; see [`StoreError::is_empty_queue`].
///
/// Slack lookups report misses with their own variants: by id through
/// `SlackMessageNotFound`, by thread location through
/// `SlackThreadNotFound`. All other entities use `ResourceNotFound`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("no export job available")]
    NoExportJobAvailable,
    #[error("no scim bridge available")]
    NoScimBridgeAvailable,
    #[error("no unsent slack message")]
    NoUnsentSlackMessage,
    #[error("{resource} not found: {id}")]
    ResourceNotFound { resource: &'static str, id: String },
    #[error("slack message not found: {0}")]
    SlackMessageNotFound(SlackMessageId),
    #[error("no initial slack message at {channel_id}/{message_ts}")]
    SlackThreadNotFound {
        channel_id: String,
        message_ts: String,
    },
    #[error("{resource} already exists: {detail}")]
    ResourceAlreadyExists {
        resource: &'static str,
        detail: String,
    },
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("{resource} {id} is locked by another transaction")]
    RowLocked { resource: &'static str, id: String },
    #[error("failed to decode {resource} row: {detail}")]
    Decode {
        resource: &'static str,
        detail: String,
    },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("database error in {operation}: {message}")]
    Database {
        operation: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Self::ResourceNotFound {
            resource,
            id: id.to_string(),
        }
    }

    pub fn already_exists(resource: &'static str, detail: impl Into<String>) -> Self {
        Self::ResourceAlreadyExists {
            resource,
            detail: detail.into(),
        }
    }

    pub fn decode(resource: &'static str, detail: impl ToString) -> Self {
        Self::Decode {
            resource,
            detail: detail.to_string(),
        }
    }

    pub fn database(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Database {
            operation,
            message: message.into(),
        }
    }

    /// True for the expected "queue is empty right now" outcomes.
    pub fn is_empty_queue(&self) -> bool {
        matches!(
            self,
            StoreError::NoExportJobAvailable
                | StoreError::NoScimBridgeAvailable
                | StoreError::NoUnsentSlackMessage
        )
    }

    /// True when the caller asked for a row that does not exist in its scope.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::ResourceNotFound { .. }
                | StoreError::SlackMessageNotFound(_)
                | StoreError::SlackThreadNotFound { .. }
        )
    }

    pub fn slack_thread_not_found(channel_id: &str, message_ts: &str) -> Self {
        Self::SlackThreadNotFound {
            channel_id: channel_id.to_string(),
            message_ts: message_ts.to_string(),
        }
    }
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition(msg) => StoreError::InvalidTransition(msg),
            other => StoreError::Serialization(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_queue_outcomes_are_distinguished_from_failures() {
        assert!(StoreError::NoExportJobAvailable.is_empty_queue());
        assert!(StoreError::NoScimBridgeAvailable.is_empty_queue());
        assert!(StoreError::NoUnsentSlackMessage.is_empty_queue());
        assert!(!StoreError::database("claim", "connection reset").is_empty_queue());
        assert!(!StoreError::not_found("export job", "x").is_empty_queue());
    }

    #[test]
    fn not_found_covers_both_variants() {
        assert!(StoreError::not_found("scim bridge", "x").is_not_found());
        assert!(StoreError::SlackMessageNotFound(SlackMessageId::new()).is_not_found());
        assert!(StoreError::slack_thread_not_found("C0123", "1700000000.000100").is_not_found());
        assert!(!StoreError::NoUnsentSlackMessage.is_not_found());
    }

    #[test]
    fn domain_transitions_map_to_invalid_transition() {
        let err: StoreError = DomainError::invalid_transition("completed -> processing").into();
        assert_eq!(
            err,
            StoreError::InvalidTransition("completed -> processing".to_string())
        );
    }
}
