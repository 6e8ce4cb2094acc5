//! SCIM bridge sync state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dispatch_core::{
    ConnectorId, DomainError, DomainResult, OrganizationId, ScimBridgeId, ScimConfigurationId,
};

use super::policy::SyncPolicy;

/// Directory the bridge reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScimBridgeType {
    GoogleWorkspace,
}

impl ScimBridgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScimBridgeType::GoogleWorkspace => "GOOGLE_WORKSPACE",
        }
    }
}

impl core::str::FromStr for ScimBridgeType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GOOGLE_WORKSPACE" => Ok(Self::GoogleWorkspace),
            other => Err(DomainError::validation(format!(
                "unknown scim bridge type: {other}"
            ))),
        }
    }
}

/// Bridge lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScimBridgeState {
    /// Last sync succeeded (or none ran yet)
    Active,
    /// A worker claimed the bridge; `updated_at` is its liveness timestamp
    Syncing,
    /// Last sync failed; due again after backoff
    Failed,
    /// Turned off by configuration; never due
    Disabled,
}

impl ScimBridgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScimBridgeState::Active => "ACTIVE",
            ScimBridgeState::Syncing => "SYNCING",
            ScimBridgeState::Failed => "FAILED",
            ScimBridgeState::Disabled => "DISABLED",
        }
    }
}

impl core::str::FromStr for ScimBridgeState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "SYNCING" => Ok(Self::Syncing),
            "FAILED" => Ok(Self::Failed),
            "DISABLED" => Ok(Self::Disabled),
            other => Err(DomainError::validation(format!(
                "unknown scim bridge state: {other}"
            ))),
        }
    }
}

/// Request to provision a bridge for a SCIM configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewScimBridge {
    pub id: ScimBridgeId,
    pub organization_id: OrganizationId,
    pub scim_configuration_id: ScimConfigurationId,
    pub connector_id: ConnectorId,
    pub bridge_type: ScimBridgeType,
    pub excluded_user_names: Vec<String>,
}

impl NewScimBridge {
    pub fn new(
        organization_id: OrganizationId,
        scim_configuration_id: ScimConfigurationId,
        connector_id: ConnectorId,
        bridge_type: ScimBridgeType,
    ) -> Self {
        Self {
            id: ScimBridgeId::new(),
            organization_id,
            scim_configuration_id,
            connector_id,
            bridge_type,
            excluded_user_names: Vec::new(),
        }
    }

    pub fn with_excluded_user_names(mut self, names: Vec<String>) -> Self {
        self.excluded_user_names = names;
        self
    }

    /// Materialize an Active bridge that is due immediately.
    pub fn into_bridge(self, now: DateTime<Utc>) -> ScimBridge {
        ScimBridge {
            id: self.id,
            organization_id: self.organization_id,
            scim_configuration_id: self.scim_configuration_id,
            connector_id: self.connector_id,
            bridge_type: self.bridge_type,
            state: ScimBridgeState::Active,
            excluded_user_names: self.excluded_user_names,
            last_synced_at: None,
            next_sync_at: None,
            sync_error: None,
            consecutive_failures: 0,
            total_sync_count: 0,
            total_failure_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Recurring synchronization state of one SCIM configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScimBridge {
    pub id: ScimBridgeId,
    pub organization_id: OrganizationId,
    pub scim_configuration_id: ScimConfigurationId,
    pub connector_id: ConnectorId,
    pub bridge_type: ScimBridgeType,
    pub state: ScimBridgeState,
    pub excluded_user_names: Vec<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// `None` means due immediately.
    pub next_sync_at: Option<DateTime<Utc>>,
    pub sync_error: Option<String>,
    pub consecutive_failures: u32,
    pub total_sync_count: u64,
    pub total_failure_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScimBridge {
    /// Whether a regular (non-reclaim) sync is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, ScimBridgeState::Active | ScimBridgeState::Failed)
            && self.next_sync_at.is_none_or(|at| at <= now)
    }

    /// Whether the bridge is Syncing with a liveness timestamp older than `stale_before`.
    pub fn is_stale(&self, stale_before: DateTime<Utc>) -> bool {
        self.state == ScimBridgeState::Syncing && self.updated_at < stale_before
    }

    /// Claim-time transition to Syncing; refreshes the liveness timestamp.
    pub fn begin_sync(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.state == ScimBridgeState::Disabled {
            return Err(DomainError::invalid_transition(format!(
                "scim bridge {} is disabled",
                self.id
            )));
        }
        self.state = ScimBridgeState::Syncing;
        self.updated_at = now;
        Ok(())
    }

    pub fn record_success(&mut self, now: DateTime<Utc>, policy: &SyncPolicy) -> DomainResult<()> {
        self.ensure_syncing()?;
        self.state = ScimBridgeState::Active;
        self.sync_error = None;
        self.consecutive_failures = 0;
        self.total_sync_count += 1;
        self.last_synced_at = Some(now);
        self.next_sync_at = Some(after(now, policy.next_delay_after_success()));
        self.updated_at = now;
        Ok(())
    }

    pub fn record_failure(
        &mut self,
        error: String,
        now: DateTime<Utc>,
        policy: &SyncPolicy,
    ) -> DomainResult<()> {
        self.ensure_syncing()?;
        self.state = ScimBridgeState::Failed;
        self.sync_error = Some(error);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.total_failure_count += 1;
        self.next_sync_at = Some(after(
            now,
            policy.next_delay_after_failure(self.consecutive_failures),
        ));
        self.updated_at = now;
        Ok(())
    }

    /// Outcomes only land on a bridge that is still mid-sync.
    fn ensure_syncing(&self) -> DomainResult<()> {
        if self.state != ScimBridgeState::Syncing {
            return Err(DomainError::invalid_transition(format!(
                "scim bridge {} is {:?}, not syncing",
                self.id, self.state
            )));
        }
        Ok(())
    }

    pub fn disable(&mut self, now: DateTime<Utc>) {
        self.state = ScimBridgeState::Disabled;
        self.updated_at = now;
    }

    /// Re-enable a disabled bridge; it becomes due immediately.
    pub fn enable(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.state != ScimBridgeState::Disabled {
            return Err(DomainError::invalid_transition(format!(
                "scim bridge {} is not disabled",
                self.id
            )));
        }
        self.state = ScimBridgeState::Active;
        self.next_sync_at = None;
        self.updated_at = now;
        Ok(())
    }
}

/// `now + delay`, saturating at the largest representable instant.
fn after(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
