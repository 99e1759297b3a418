//! Daemon configuration loaded from environment variables.

use crate::error::DaemonError;
use std::time::Duration;

/// Default period of the allocation synchronizer
pub const DEFAULT_SYNC_INTERVAL_SECONDS: u64 = 600;

/// Default lifetime of deallocation history entries
pub const DEFAULT_HISTORY_TIMEOUT_SECONDS: u64 = 60;

/// Node IPAM daemon configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Name of the node this daemon serves
    pub node_name: String,

    /// Period of the allocation synchronizer
    pub sync_interval: Duration,

    /// How long freed offsets stay reserved
    pub history_timeout: Duration,
}

impl DaemonConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, DaemonError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through a variable lookup function
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, DaemonError> {
        let node_name = lookup("K8S_NODENAME")
            .map(|raw| raw.trim().to_string())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| DaemonError::InvalidConfig("K8S_NODENAME must be set".to_string()))?;

        let sync_seconds = seconds(&lookup, "SYNC_INTERVAL_SECONDS", DEFAULT_SYNC_INTERVAL_SECONDS)?;
        let history_seconds = seconds(&lookup, "HISTORY_TIMEOUT_SECONDS", DEFAULT_HISTORY_TIMEOUT_SECONDS)?;

        Ok(Self {
            node_name,
            sync_interval: Duration::from_secs(sync_seconds),
            history_timeout: Duration::from_secs(history_seconds),
        })
    }
}

fn seconds(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<u64, DaemonError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<u64>().ok().filter(|s| *s > 0).ok_or_else(|| {
            DaemonError::InvalidConfig(format!("{} must be a positive integer, got {:?}", key, raw))
        }),
    }
}
