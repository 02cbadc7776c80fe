//! Fluent builder API for connecting network sessions.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use chainevents_core::{CommitStrategy, FanoutBlockSource, NetworkBuilder};
//!
//! let blocks = Arc::new(FanoutBlockSource::new());
//! let session = NetworkBuilder::new()
//!     .channel("orders")
//!     .commit_strategy(CommitStrategy::AnyPeer)
//!     .commit_timeout_ms(5_000)
//!     .block_source(blocks)
//!     .connect()
//!     .unwrap();
//! assert_eq!(session.channel(), "orders");
//! ```

use std::sync::Arc;

use crate::config::NetworkConfig;
use crate::error::EventError;
use crate::network::NetworkSession;
use crate::source::{BlockEventSource, PeerDisconnectSource};
use crate::waiter::CommitStrategy;

/// Fluent builder for [`NetworkSession`].
#[derive(Default)]
pub struct NetworkBuilder {
    config: NetworkConfig,
    block_source: Option<Arc<dyn BlockEventSource>>,
    disconnect_sources: Vec<Arc<dyn PeerDisconnectSource>>,
}

impl NetworkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the channel name.
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.config.channel = channel.into();
        self
    }

    /// Set how commit waits decide completion.
    pub fn commit_strategy(mut self, strategy: CommitStrategy) -> Self {
        self.config.commit_strategy = strategy;
        self
    }

    /// Set the commit wait timeout in milliseconds.
    pub fn commit_timeout_ms(mut self, ms: u64) -> Self {
        self.config.commit_timeout_ms = ms;
        self
    }

    /// Replace the whole configuration, e.g. one loaded from a file.
    pub fn config(mut self, config: NetworkConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the block event feed for the channel.
    pub fn block_source(mut self, source: Arc<dyn BlockEventSource>) -> Self {
        self.block_source = Some(source);
        self
    }

    /// Add the disconnect feed of one peer.
    pub fn disconnect_source(mut self, source: Arc<dyn PeerDisconnectSource>) -> Self {
        self.disconnect_sources.push(source);
        self
    }

    /// Build the `NetworkConfig` only.
    pub fn build_config(self) -> NetworkConfig {
        self.config
    }

    /// Connect a session to the configured sources.
    pub fn connect(self) -> Result<NetworkSession, EventError> {
        let block_source = self
            .block_source
            .ok_or_else(|| EventError::Config("no block event source configured".into()))?;
        NetworkSession::connect(self.config, block_source, self.disconnect_sources)
    }
}
