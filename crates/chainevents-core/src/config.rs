//! Network session configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EventError;
use crate::waiter::CommitStrategy;

fn default_channel() -> String {
    "mychannel".into()
}

fn default_commit_timeout_ms() -> u64 {
    30_000
}

/// Configuration for one network session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Channel the session listens on.
    #[serde(default = "default_channel")]
    pub channel: String,
    /// How commit waits decide completion.
    #[serde(default)]
    pub commit_strategy: CommitStrategy,
    /// Upper bound on a single commit wait.
    #[serde(default = "default_commit_timeout_ms")]
    pub commit_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            commit_strategy: CommitStrategy::default(),
            commit_timeout_ms: default_commit_timeout_ms(),
        }
    }
}

impl NetworkConfig {
    pub fn from_json_str(json: &str) -> Result<Self, EventError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EventError::Config(format!("invalid network config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EventError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| EventError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), EventError> {
        if self.channel.trim().is_empty() {
            return Err(EventError::Config("channel name must not be empty".into()));
        }
        if self.commit_timeout_ms == 0 {
            return Err(EventError::Config("commit_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg = NetworkConfig::from_json_str(r#"{ "channel": "orders" }"#).unwrap();
        assert_eq!(cfg.channel, "orders");
        assert_eq!(cfg.commit_strategy, CommitStrategy::AllPeers);
        assert_eq!(cfg.commit_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn strategy_is_snake_case() {
        let cfg =
            NetworkConfig::from_json_str(r#"{ "commit_strategy": "any_peer", "commit_timeout_ms": 500 }"#)
                .unwrap();
        assert_eq!(cfg.commit_strategy, CommitStrategy::AnyPeer);
        assert_eq!(cfg.commit_timeout_ms, 500);
    }

    #[test]
    fn rejects_empty_channel_and_zero_timeout() {
        assert!(NetworkConfig::from_json_str(r#"{ "channel": " " }"#).is_err());
        assert!(NetworkConfig::from_json_str(r#"{ "commit_timeout_ms": 0 }"#).is_err());
        assert!(NetworkConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = NetworkConfig::from_file("/nonexistent/network.json").unwrap_err();
        assert!(matches!(err, EventError::Config(_)));
    }
}
