//! Commit tracker: narrows the block stream and peer disconnect feeds down
//! to one transaction id on one set of peers.
//!
//! Each registration rides on its own block dispatcher registration, so it
//! inherits block-level de-duplication, and subscribes to the disconnect
//! source of every peer it names.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::dispatcher::{BlockDispatcher, ListenOptions};
use crate::error::EventError;
use crate::gate::Gate;
use crate::listener::{call_listener, listener_key, BlockListener, CommitListener, DisconnectListener};
use crate::source::{PeerDisconnectSource, SubscriptionId};
use crate::types::{BlockEvent, PeerDisconnectEvent, PeerRef, TransactionEvent};

/// Forwards matching commits and disconnects to one commit listener.
struct CommitRelay {
    channel: String,
    listener: Arc<dyn CommitListener>,
    transaction_id: String,
    peers: HashSet<PeerRef>,
    gate: Gate<()>,
}

impl CommitRelay {
    fn matches(&self, transaction: &TransactionEvent) -> bool {
        transaction.transaction_id == self.transaction_id && self.peers.contains(&transaction.peer)
    }
}

impl BlockListener for CommitRelay {
    fn accept(&self, block: &BlockEvent) -> Result<(), EventError> {
        self.gate.enter(|_| {
            for transaction in block.transactions.iter().filter(|tx| self.matches(tx)) {
                // The listener may have removed itself on an earlier match.
                if !self.gate.is_open() {
                    break;
                }
                call_listener(&self.channel, "commit", || self.listener.accept_commit(transaction));
            }
        });
        Ok(())
    }
}

impl DisconnectListener for CommitRelay {
    fn on_disconnect(&self, event: &PeerDisconnectEvent) -> Result<(), EventError> {
        if !self.peers.contains(&event.peer) {
            return Ok(());
        }
        self.gate.enter(|_| {
            call_listener(&self.channel, "disconnect", || self.listener.accept_disconnect(event));
        });
        Ok(())
    }
}

struct CommitRegistration {
    relay: Arc<CommitRelay>,
    disconnect_subscriptions: Vec<(Arc<dyn PeerDisconnectSource>, SubscriptionId)>,
}

/// Tracks commit listeners for one network.
pub struct CommitTracker {
    dispatcher: Arc<BlockDispatcher>,
    disconnect_sources: HashMap<PeerRef, Arc<dyn PeerDisconnectSource>>,
    registrations: Mutex<HashMap<usize, CommitRegistration>>,
    closed: AtomicBool,
}

impl CommitTracker {
    pub fn new(
        dispatcher: Arc<BlockDispatcher>,
        disconnect_sources: impl IntoIterator<Item = Arc<dyn PeerDisconnectSource>>,
    ) -> Self {
        let disconnect_sources = disconnect_sources
            .into_iter()
            .map(|source| (source.peer().clone(), source))
            .collect();
        Self {
            dispatcher,
            disconnect_sources,
            registrations: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn channel(&self) -> &str {
        self.dispatcher.channel()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Register `listener` for commits of `transaction_id` on `peers`.
    /// Returns the same listener value.
    pub fn add_commit_listener<L>(
        &self,
        listener: Arc<L>,
        peers: impl IntoIterator<Item = PeerRef>,
        transaction_id: impl Into<String>,
    ) -> Result<Arc<L>, EventError>
    where
        L: CommitListener + 'static,
    {
        let key = listener_key(&listener);
        let relay = Arc::new(CommitRelay {
            channel: self.channel().to_string(),
            listener: Arc::clone(&listener) as Arc<dyn CommitListener>,
            transaction_id: transaction_id.into(),
            peers: peers.into_iter().collect(),
            gate: Gate::new(()),
        });

        let replaced = {
            let mut registrations = self.registrations.lock().unwrap();
            if self.is_closed() {
                return Err(EventError::SessionClosed {
                    channel: self.channel().to_string(),
                });
            }
            self.dispatcher
                .add_listener(Arc::clone(&relay), ListenOptions::new())?;

            let mut disconnect_subscriptions = vec![];
            for peer in &relay.peers {
                match self.disconnect_sources.get(peer) {
                    Some(source) => {
                        let id = source.subscribe(Arc::clone(&relay) as Arc<dyn DisconnectListener>);
                        disconnect_subscriptions.push((Arc::clone(source), id));
                    }
                    None => {
                        debug!(channel = %self.channel(), %peer, "No disconnect source for peer");
                    }
                }
            }
            debug!(
                channel = %self.channel(),
                transaction_id = %relay.transaction_id,
                peers = relay.peers.len(),
                "Commit listener added"
            );
            registrations.insert(
                key,
                CommitRegistration {
                    relay,
                    disconnect_subscriptions,
                },
            )
        };
        if let Some(previous) = replaced {
            self.teardown(previous);
        }
        Ok(listener)
    }

    /// Remove a commit listener. Returns `false` if it was not registered.
    ///
    /// Once this returns, the listener receives no further callbacks.
    pub fn remove_commit_listener<L: ?Sized>(&self, listener: &Arc<L>) -> bool {
        let removed = self
            .registrations
            .lock()
            .unwrap()
            .remove(&listener_key(listener));
        match removed {
            Some(registration) => {
                self.teardown(registration);
                true
            }
            None => false,
        }
    }

    fn teardown(&self, registration: CommitRegistration) {
        self.dispatcher.remove_listener(&registration.relay);
        for (source, id) in registration.disconnect_subscriptions {
            source.unsubscribe(id);
        }
        registration.relay.gate.close();
    }

    /// Number of active commit listeners.
    pub fn listener_count(&self) -> usize {
        self.registrations.lock().unwrap().len()
    }

    /// Remove every commit listener and refuse new ones.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<CommitRegistration> = self
            .registrations
            .lock()
            .unwrap()
            .drain()
            .map(|(_, registration)| registration)
            .collect();
        for registration in drained {
            self.teardown(registration);
        }
    }
}

impl Drop for CommitTracker {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FanoutBlockSource, FanoutDisconnectSource};
    use crate::types::ValidationCode;

    #[derive(Default)]
    struct Counts {
        commits: Mutex<Vec<TransactionEvent>>,
        disconnects: Mutex<Vec<PeerRef>>,
    }

    impl CommitListener for Counts {
        fn accept_commit(&self, transaction: &TransactionEvent) -> Result<(), EventError> {
            self.commits.lock().unwrap().push(transaction.clone());
            Ok(())
        }

        fn accept_disconnect(&self, event: &PeerDisconnectEvent) -> Result<(), EventError> {
            self.disconnects.lock().unwrap().push(event.peer.clone());
            Ok(())
        }
    }

    struct Fixture {
        source: Arc<FanoutBlockSource>,
        peer1: Arc<FanoutDisconnectSource>,
        tracker: CommitTracker,
    }

    fn fixture() -> Fixture {
        let source = Arc::new(FanoutBlockSource::new());
        let dispatcher = BlockDispatcher::start("mychannel", source.clone());
        let peer1 = Arc::new(FanoutDisconnectSource::new("peer1".into()));
        let tracker = CommitTracker::new(dispatcher, vec![peer1.clone() as Arc<dyn PeerDisconnectSource>]);
        Fixture { source, peer1, tracker }
    }

    #[test]
    fn one_callback_per_matching_peer_report() {
        let f = fixture();
        let listener = f
            .tracker
            .add_commit_listener(
                Arc::new(Counts::default()),
                vec![PeerRef::new("peer1"), PeerRef::new("peer2")],
                "txId",
            )
            .unwrap();

        let block = BlockEvent::new(1, "peer1".into())
            .with_transaction("txId", ValidationCode::Valid)
            .with_peer_transaction("txId", "peer2".into(), ValidationCode::Valid)
            .with_peer_transaction("txId", "peer3".into(), ValidationCode::Valid);
        f.source.send(&block);

        let peers: Vec<String> = listener
            .commits
            .lock()
            .unwrap()
            .iter()
            .map(|tx| tx.peer.to_string())
            .collect();
        assert_eq!(peers, vec!["peer1", "peer2"]);
    }

    #[test]
    fn peer_without_disconnect_source_is_tolerated() {
        let f = fixture();
        f.tracker
            .add_commit_listener(Arc::new(Counts::default()), vec![PeerRef::new("peer9")], "tx")
            .unwrap();
        assert_eq!(f.tracker.listener_count(), 1);
        assert_eq!(f.peer1.subscriber_count(), 0);
    }

    #[test]
    fn removal_unsubscribes_from_both_feeds() {
        let f = fixture();
        let listener = f
            .tracker
            .add_commit_listener(Arc::new(Counts::default()), vec![PeerRef::new("peer1")], "tx")
            .unwrap();
        assert_eq!(f.peer1.subscriber_count(), 1);

        assert!(f.tracker.remove_commit_listener(&listener));
        assert!(!f.tracker.remove_commit_listener(&listener));
        assert_eq!(f.peer1.subscriber_count(), 0);
        assert_eq!(f.tracker.listener_count(), 0);
    }

    struct RemovesItself {
        tracker: std::sync::Weak<CommitTracker>,
        me: std::sync::Weak<RemovesItself>,
        calls: Mutex<Vec<PeerRef>>,
    }

    impl CommitListener for RemovesItself {
        fn accept_commit(&self, transaction: &TransactionEvent) -> Result<(), EventError> {
            self.calls.lock().unwrap().push(transaction.peer.clone());
            if let (Some(tracker), Some(me)) = (self.tracker.upgrade(), self.me.upgrade()) {
                tracker.remove_commit_listener(&me);
            }
            Ok(())
        }

        fn accept_disconnect(&self, _: &PeerDisconnectEvent) -> Result<(), EventError> {
            Ok(())
        }
    }

    #[test]
    fn self_removal_stops_remaining_matches_in_the_block() {
        let source = Arc::new(FanoutBlockSource::new());
        let dispatcher = BlockDispatcher::start("mychannel", source.clone());
        let tracker = Arc::new(CommitTracker::new(dispatcher, Vec::<Arc<dyn PeerDisconnectSource>>::new()));
        let listener = Arc::new_cyclic(|me| RemovesItself {
            tracker: Arc::downgrade(&tracker),
            me: me.clone(),
            calls: Mutex::new(vec![]),
        });
        tracker
            .add_commit_listener(
                listener.clone(),
                vec![PeerRef::new("peer1"), PeerRef::new("peer2")],
                "tx",
            )
            .unwrap();

        source.send(
            &BlockEvent::new(1, "peer1".into())
                .with_transaction("tx", ValidationCode::Valid)
                .with_peer_transaction("tx", "peer2".into(), ValidationCode::Valid),
        );

        assert_eq!(*listener.calls.lock().unwrap(), vec![PeerRef::new("peer1")]);
        assert_eq!(tracker.listener_count(), 0);
    }

    #[test]
    fn closed_tracker_rejects_listeners() {
        let f = fixture();
        f.tracker.close();
        let err = f
            .tracker
            .add_commit_listener(Arc::new(Counts::default()), vec![PeerRef::new("peer1")], "tx")
            .err()
            .unwrap();
        assert!(matches!(err, EventError::SessionClosed { .. }));
    }
}
