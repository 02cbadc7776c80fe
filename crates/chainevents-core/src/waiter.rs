//! Commit waiter: waits until a transaction commits on a set of peers.
//!
//! Register the waiter *before* submitting the transaction so the commit
//! cannot be missed, then await [`CommitWaiter::wait`].

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::commit::CommitTracker;
use crate::error::EventError;
use crate::listener::CommitListener;
use crate::types::{PeerDisconnectEvent, PeerRef, TransactionEvent};

/// When a commit wait counts as complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStrategy {
    /// Every peer has either committed or disconnected, and at least one
    /// peer committed.
    #[default]
    AllPeers,
    /// The first peer to commit.
    AnyPeer,
}

/// Result of a successful wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub transaction_id: String,
    /// Block the transaction was committed in, as reported by the first peer.
    pub block_number: u64,
    pub committed: Vec<PeerRef>,
    pub disconnected: Vec<PeerRef>,
}

enum Signal {
    Commit(TransactionEvent),
    Disconnect(PeerRef),
}

struct ChannelCommitListener {
    tx: mpsc::UnboundedSender<Signal>,
}

impl CommitListener for ChannelCommitListener {
    fn accept_commit(&self, transaction: &TransactionEvent) -> Result<(), EventError> {
        let _ = self.tx.send(Signal::Commit(transaction.clone()));
        Ok(())
    }

    fn accept_disconnect(&self, event: &PeerDisconnectEvent) -> Result<(), EventError> {
        let _ = self.tx.send(Signal::Disconnect(event.peer.clone()));
        Ok(())
    }
}

/// A pending wait for one transaction.
///
/// Dropping the waiter removes its commit listener.
pub struct CommitWaiter {
    tracker: Arc<CommitTracker>,
    // Weak so that closing the tracker drops the sender and ends the wait.
    listener: Weak<ChannelCommitListener>,
    rx: mpsc::UnboundedReceiver<Signal>,
    transaction_id: String,
    pending: HashSet<PeerRef>,
    strategy: CommitStrategy,
    timeout: Duration,
}

impl CommitWaiter {
    pub fn register(
        tracker: Arc<CommitTracker>,
        transaction_id: impl Into<String>,
        peers: impl IntoIterator<Item = PeerRef>,
        strategy: CommitStrategy,
        timeout: Duration,
    ) -> Result<Self, EventError> {
        let transaction_id = transaction_id.into();
        let pending: HashSet<PeerRef> = peers.into_iter().collect();
        if pending.is_empty() {
            return Err(EventError::Config(format!(
                "no peers to wait on for transaction {transaction_id}"
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = tracker.add_commit_listener(
            Arc::new(ChannelCommitListener { tx }),
            pending.iter().cloned(),
            transaction_id.clone(),
        )?;
        Ok(Self {
            listener: Arc::downgrade(&listener),
            tracker,
            rx,
            transaction_id,
            pending,
            strategy,
            timeout,
        })
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// Wait for the commit according to the strategy, up to the timeout.
    pub async fn wait(mut self) -> Result<CommitOutcome, EventError> {
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.collect()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    transaction_id = %self.transaction_id,
                    pending = self.pending.len(),
                    "Timed out waiting for commit"
                );
                Err(EventError::CommitTimeout {
                    transaction_id: self.transaction_id.clone(),
                    ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn collect(&mut self) -> Result<CommitOutcome, EventError> {
        let mut outcome = CommitOutcome {
            transaction_id: self.transaction_id.clone(),
            block_number: 0,
            committed: vec![],
            disconnected: vec![],
        };

        while let Some(signal) = self.rx.recv().await {
            match signal {
                Signal::Commit(transaction) => {
                    // A peer reports a transaction once; ignore repeats.
                    if !self.pending.remove(&transaction.peer) {
                        continue;
                    }
                    if !transaction.is_valid() {
                        return Err(EventError::CommitRejected {
                            transaction_id: transaction.transaction_id,
                            peer: transaction.peer,
                            code: transaction.validation_code,
                        });
                    }
                    debug!(
                        transaction_id = %self.transaction_id,
                        peer = %transaction.peer,
                        block = transaction.block_number,
                        "Commit observed"
                    );
                    if outcome.committed.is_empty() {
                        outcome.block_number = transaction.block_number;
                    }
                    outcome.committed.push(transaction.peer);
                    if self.strategy == CommitStrategy::AnyPeer {
                        return Ok(outcome);
                    }
                }
                Signal::Disconnect(peer) => {
                    if self.pending.remove(&peer) {
                        debug!(transaction_id = %self.transaction_id, %peer, "Peer disconnected during commit wait");
                        outcome.disconnected.push(peer);
                    }
                }
            }

            if self.pending.is_empty() {
                return if outcome.committed.is_empty() {
                    Err(EventError::PeersDisconnected {
                        transaction_id: self.transaction_id.clone(),
                    })
                } else {
                    Ok(outcome)
                };
            }
        }

        // Sender dropped: the tracker removed our listener.
        Err(EventError::SessionClosed {
            channel: self.tracker.channel().to_string(),
        })
    }
}

impl Drop for CommitWaiter {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.upgrade() {
            self.tracker.remove_commit_listener(&listener);
        }
    }
}
