//! Controller configuration loaded from environment variables.

use crate::error::ControllerError;
use std::time::Duration;

/// Default period of the full resync
pub const DEFAULT_RESYNC_INTERVAL_SECONDS: u64 = 600;

/// CIDR Controller configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Period of the full resync of every plan
    pub resync_interval: Duration,
}

impl ControllerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through a variable lookup function
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let resync_seconds = match lookup("RESYNC_INTERVAL_SECONDS") {
            None => DEFAULT_RESYNC_INTERVAL_SECONDS,
            Some(raw) => raw.trim().parse::<u64>().ok().filter(|s| *s > 0).ok_or_else(|| {
                ControllerError::InvalidConfig(format!(
                    "RESYNC_INTERVAL_SECONDS must be a positive integer, got {:?}",
                    raw
                ))
            })?,
        };

        Ok(Self {
            resync_interval: Duration::from_secs(resync_seconds),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.resync_interval, Duration::from_secs(600));
    }

    #[test]
    fn test_resync_override() {
        let config = ControllerConfig::from_lookup(|key| {
            (key == "RESYNC_INTERVAL_SECONDS").then(|| "30".to_string())
        })
        .unwrap();
        assert_eq!(config.resync_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_resync() {
        for raw in ["abc", "0", "-5"] {
            let err = ControllerConfig::from_lookup(|_| Some(raw.to_string())).unwrap_err();
            assert!(matches!(err, ControllerError::InvalidConfig(_)));
        }
    }
}
