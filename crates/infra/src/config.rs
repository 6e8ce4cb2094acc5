//! Configuration loading.
//!
//! Everything is read from environment variables; [`DispatchConfig::from_lookup`]
//! takes any key lookup so parsing is testable without touching the process
//! environment.

use std::time::Duration;

use crate::scim_bridges::{BackoffPolicy, BackoffStrategy, SyncPolicy};
use crate::workers::PollConfig;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Database connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Complete worker process configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    pub database: DatabaseConfig,
    pub poll: PollConfig,
    pub sync: SyncPolicy,
    /// How long a bridge may sit in Syncing before another worker reclaims it.
    pub staleness_threshold: Duration,
}

impl DispatchConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let max_connections = parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 5u32)?;

        let poll = PollConfig {
            poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "DISPATCH_POLL_INTERVAL_MS",
                1_000u64,
            )?),
            jitter: Duration::from_millis(parse_or(&lookup, "DISPATCH_POLL_JITTER_MS", 100u64)?),
            shutdown_when_queue_empty: false,
        };

        let strategy = match lookup("SCIM_BACKOFF_STRATEGY") {
            None => BackoffStrategy::default(),
            Some(value) => value.parse().map_err(|reason: String| ConfigError::Invalid {
                key: "SCIM_BACKOFF_STRATEGY",
                value,
                reason,
            })?,
        };

        let sync = SyncPolicy {
            interval: Duration::from_secs(parse_or(&lookup, "SCIM_SYNC_INTERVAL_SECS", 3_600u64)?),
            backoff: BackoffPolicy {
                base_delay: Duration::from_secs(parse_or(
                    &lookup,
                    "SCIM_BACKOFF_BASE_SECS",
                    60u64,
                )?),
                max_delay: Duration::from_secs(parse_or(
                    &lookup,
                    "SCIM_BACKOFF_MAX_SECS",
                    21_600u64,
                )?),
                strategy,
            },
        };

        if sync.backoff.max_delay < sync.backoff.base_delay {
            return Err(ConfigError::Invalid {
                key: "SCIM_BACKOFF_MAX_SECS",
                value: sync.backoff.max_delay.as_secs().to_string(),
                reason: "must not be lower than SCIM_BACKOFF_BASE_SECS".to_string(),
            });
        }

        let staleness_threshold = Duration::from_secs(parse_or(
            &lookup,
            "SCIM_STALENESS_THRESHOLD_SECS",
            900u64,
        )?);

        Ok(Self {
            database: DatabaseConfig {
                url,
                max_connections,
            },
            poll,
            sync,
            staleness_threshold,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}
