//! Network session: owns the block dispatcher and commit tracker for one
//! channel and tears both down on close.

use std::sync::Arc;

use tracing::info;

use crate::checkpoint::Checkpoint;
use crate::commit::CommitTracker;
use crate::config::NetworkConfig;
use crate::dispatcher::{BlockDispatcher, ListenOptions};
use crate::error::EventError;
use crate::listener::{BlockListener, CommitListener, TransactionListener};
use crate::source::{BlockEventSource, PeerDisconnectSource};
use crate::types::PeerRef;
use crate::waiter::CommitWaiter;

/// Listener registry for one connected channel.
///
/// Every `add_*` call returns the listener it was given; pass that same
/// `Arc` to the matching `remove_*` call.
pub struct NetworkSession {
    config: NetworkConfig,
    dispatcher: Arc<BlockDispatcher>,
    commits: Arc<CommitTracker>,
}

impl NetworkSession {
    pub fn connect(
        config: NetworkConfig,
        block_source: Arc<dyn BlockEventSource>,
        disconnect_sources: impl IntoIterator<Item = Arc<dyn PeerDisconnectSource>>,
    ) -> Result<Self, EventError> {
        config.validate()?;
        let dispatcher = BlockDispatcher::start(config.channel.clone(), block_source);
        let commits = Arc::new(CommitTracker::new(Arc::clone(&dispatcher), disconnect_sources));
        info!(
            channel = %config.channel,
            strategy = ?config.commit_strategy,
            "Network session connected"
        );
        Ok(Self {
            config,
            dispatcher,
            commits,
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn channel(&self) -> &str {
        &self.config.channel
    }

    // ─── Block listeners ──────────────────────────────────────────────────────

    /// Listen from the next block observed.
    pub fn add_block_listener<L>(&self, listener: Arc<L>) -> Result<Arc<L>, EventError>
    where
        L: BlockListener + 'static,
    {
        self.dispatcher.add_listener(listener, ListenOptions::new())
    }

    /// Listen from the block after the checkpoint's, persisting progress.
    pub fn add_checkpoint_listener<L>(
        &self,
        checkpoint: Arc<dyn Checkpoint>,
        listener: Arc<L>,
    ) -> Result<Arc<L>, EventError>
    where
        L: BlockListener + 'static,
    {
        self.dispatcher
            .add_listener(listener, ListenOptions::new().checkpoint(checkpoint))
    }

    /// Replay from `start_block` onwards.
    pub fn add_replay_listener<L>(&self, start_block: u64, listener: Arc<L>) -> Result<Arc<L>, EventError>
    where
        L: BlockListener + 'static,
    {
        self.dispatcher
            .add_listener(listener, ListenOptions::new().start_block(start_block))
    }

    pub fn add_block_listener_with<L>(
        &self,
        options: ListenOptions,
        listener: Arc<L>,
    ) -> Result<Arc<L>, EventError>
    where
        L: BlockListener + 'static,
    {
        self.dispatcher.add_listener(listener, options)
    }

    pub fn add_transaction_listener<L>(
        &self,
        options: ListenOptions,
        listener: Arc<L>,
    ) -> Result<Arc<L>, EventError>
    where
        L: TransactionListener + 'static,
    {
        self.dispatcher.add_transaction_listener(listener, options)
    }

    pub fn remove_block_listener<L: ?Sized>(&self, listener: &Arc<L>) -> bool {
        self.dispatcher.remove_listener(listener)
    }

    // ─── Commit listeners ─────────────────────────────────────────────────────

    pub fn add_commit_listener<L>(
        &self,
        listener: Arc<L>,
        peers: impl IntoIterator<Item = PeerRef>,
        transaction_id: impl Into<String>,
    ) -> Result<Arc<L>, EventError>
    where
        L: CommitListener + 'static,
    {
        self.commits.add_commit_listener(listener, peers, transaction_id)
    }

    pub fn remove_commit_listener<L: ?Sized>(&self, listener: &Arc<L>) -> bool {
        self.commits.remove_commit_listener(listener)
    }

    /// Start waiting for `transaction_id` to commit on `peers`, using the
    /// configured strategy and timeout. Call before submitting the
    /// transaction, then await [`CommitWaiter::wait`].
    pub fn wait_for_commit(
        &self,
        transaction_id: impl Into<String>,
        peers: impl IntoIterator<Item = PeerRef>,
    ) -> Result<CommitWaiter, EventError> {
        CommitWaiter::register(
            Arc::clone(&self.commits),
            transaction_id,
            peers,
            self.config.commit_strategy,
            self.config.commit_timeout(),
        )
    }

    // ─── Lifecycle ────────────────────────────────────────────────────────────

    /// Number of active block and transaction listeners, commit relays included.
    pub fn block_listener_count(&self) -> usize {
        self.dispatcher.listener_count()
    }

    pub fn commit_listener_count(&self) -> usize {
        self.commits.listener_count()
    }

    pub fn is_closed(&self) -> bool {
        self.dispatcher.is_closed()
    }

    /// Remove every listener and unsubscribe from all sources.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.commits.close();
        self.dispatcher.close();
        info!(channel = %self.config.channel, "Network session closed");
    }
}

impl Drop for NetworkSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FanoutBlockSource, FanoutDisconnectSource};
    use crate::types::{BlockEvent, PeerDisconnectEvent, TransactionEvent};
    use std::sync::Mutex;

    struct NoopCommit;

    impl CommitListener for NoopCommit {
        fn accept_commit(&self, _: &TransactionEvent) -> Result<(), EventError> {
            Ok(())
        }

        fn accept_disconnect(&self, _: &PeerDisconnectEvent) -> Result<(), EventError> {
            Ok(())
        }
    }

    fn no_peers() -> Vec<Arc<dyn PeerDisconnectSource>> {
        vec![]
    }

    #[test]
    fn close_tears_down_all_subscriptions() {
        let source = Arc::new(FanoutBlockSource::new());
        let peer = Arc::new(FanoutDisconnectSource::new("peer1".into()));
        let session = NetworkSession::connect(
            NetworkConfig::default(),
            source.clone(),
            vec![peer.clone() as Arc<dyn PeerDisconnectSource>],
        )
        .unwrap();

        let blocks = Arc::new(Mutex::new(vec![]));
        let sink = blocks.clone();
        session
            .add_block_listener(Arc::new(move |b: &BlockEvent| -> Result<(), EventError> {
                sink.lock().unwrap().push(b.block_number);
                Ok(())
            }))
            .unwrap();
        session
            .add_commit_listener(
                Arc::new(NoopCommit),
                vec![PeerRef::new("peer1")],
                "tx1",
            )
            .unwrap();
        assert_eq!(source.subscriber_count(), 1);
        assert_eq!(peer.subscriber_count(), 1);

        session.close();
        assert!(session.is_closed());
        assert_eq!(source.subscriber_count(), 0);
        assert_eq!(peer.subscriber_count(), 0);
        assert_eq!(session.block_listener_count(), 0);
        assert_eq!(session.commit_listener_count(), 0);

        source.send(&BlockEvent::new(1, "peer1".into()));
        assert!(blocks.lock().unwrap().is_empty());

        let err = session
            .add_replay_listener(0, Arc::new(|_: &BlockEvent| -> Result<(), EventError> { Ok(()) }))
            .err()
            .unwrap();
        assert!(matches!(err, EventError::SessionClosed { .. }));
    }

    #[test]
    fn drop_unsubscribes_from_source() {
        let source = Arc::new(FanoutBlockSource::new());
        {
            let _session =
                NetworkSession::connect(NetworkConfig::default(), source.clone(), no_peers()).unwrap();
            assert_eq!(source.subscriber_count(), 1);
        }
        assert_eq!(source.subscriber_count(), 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = NetworkConfig {
            channel: String::new(),
            ..NetworkConfig::default()
        };
        let source = Arc::new(FanoutBlockSource::new());
        assert!(NetworkSession::connect(config, source, no_peers()).is_err());
    }
}
