//! Event sources: the push feeds the dispatcher and commit tracker consume.
//!
//! Connecting to peers is outside this crate; a peer integration implements
//! [`BlockEventSource`] and [`PeerDisconnectSource`]. The fan-out sources here
//! are in-process implementations for embedding and tests, and the pump
//! helpers bridge async streams and channels into them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::listener::{call_listener, BlockListener, DisconnectListener};
use crate::types::{BlockEvent, PeerDisconnectEvent, PeerRef};

/// Handle returned by a source's `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A live feed of block events for one network.
pub trait BlockEventSource: Send + Sync {
    fn subscribe(&self, listener: Arc<dyn BlockListener>) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);
}

/// A feed of disconnect notifications for a single peer.
pub trait PeerDisconnectSource: Send + Sync {
    /// The peer this source reports on.
    fn peer(&self) -> &PeerRef;

    fn subscribe(&self, listener: Arc<dyn DisconnectListener>) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);
}

// ─── Subscriber list ──────────────────────────────────────────────────────────

struct Subscribers<L: ?Sized> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(SubscriptionId, Arc<L>)>>,
}

impl<L: ?Sized> Subscribers<L> {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(vec![]),
        }
    }

    fn add(&self, listener: Arc<L>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().unwrap().push((id, listener));
        id
    }

    fn remove(&self, id: SubscriptionId) {
        self.entries.lock().unwrap().retain(|(entry, _)| *entry != id);
    }

    fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

// ─── FanoutBlockSource ────────────────────────────────────────────────────────

/// In-process block source: every [`send`](Self::send) is pushed
/// synchronously to all current subscribers.
pub struct FanoutBlockSource {
    subscribers: Subscribers<dyn BlockListener>,
}

impl FanoutBlockSource {
    pub fn new() -> Self {
        Self {
            subscribers: Subscribers::new(),
        }
    }

    pub fn send(&self, block: &BlockEvent) {
        for listener in self.subscribers.snapshot() {
            call_listener("source", "block", || listener.accept(block));
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for FanoutBlockSource {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockEventSource for FanoutBlockSource {
    fn subscribe(&self, listener: Arc<dyn BlockListener>) -> SubscriptionId {
        self.subscribers.add(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.remove(id);
    }
}

// ─── FanoutDisconnectSource ───────────────────────────────────────────────────

/// In-process disconnect source for one peer.
pub struct FanoutDisconnectSource {
    peer: PeerRef,
    subscribers: Subscribers<dyn DisconnectListener>,
}

impl FanoutDisconnectSource {
    pub fn new(peer: PeerRef) -> Self {
        Self {
            peer,
            subscribers: Subscribers::new(),
        }
    }

    /// Report that this source's peer disconnected.
    pub fn disconnect(&self) {
        self.send(&PeerDisconnectEvent::new(self.peer.clone()));
    }

    pub fn send(&self, event: &PeerDisconnectEvent) {
        for listener in self.subscribers.snapshot() {
            call_listener("source", "disconnect", || listener.on_disconnect(event));
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl PeerDisconnectSource for FanoutDisconnectSource {
    fn peer(&self) -> &PeerRef {
        &self.peer
    }

    fn subscribe(&self, listener: Arc<dyn DisconnectListener>) -> SubscriptionId {
        self.subscribers.add(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.remove(id);
    }
}

// ─── Pumps ────────────────────────────────────────────────────────────────────

/// Forward every block from `blocks` into `source` until the stream ends.
/// Returns the number of blocks forwarded.
pub async fn pump_blocks<S>(source: &FanoutBlockSource, blocks: S) -> u64
where
    S: Stream<Item = BlockEvent>,
{
    futures::pin_mut!(blocks);
    let mut forwarded = 0u64;
    while let Some(block) = blocks.next().await {
        source.send(&block);
        forwarded += 1;
    }
    debug!(forwarded, "Block stream ended");
    forwarded
}

/// Forward disconnect events for the source's own peer; others are dropped.
pub async fn pump_disconnects<S>(source: &FanoutDisconnectSource, events: S) -> u64
where
    S: Stream<Item = PeerDisconnectEvent>,
{
    futures::pin_mut!(events);
    let mut forwarded = 0u64;
    while let Some(event) = events.next().await {
        if event.peer != source.peer {
            continue;
        }
        source.send(&event);
        forwarded += 1;
    }
    debug!(peer = %source.peer, forwarded, "Disconnect stream ended");
    forwarded
}

/// Spawn a task that feeds blocks received on `rx` into `source`.
pub fn spawn_block_feed(
    source: Arc<FanoutBlockSource>,
    mut rx: mpsc::UnboundedReceiver<BlockEvent>,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut forwarded = 0u64;
        while let Some(block) = rx.recv().await {
            source.send(&block);
            forwarded += 1;
        }
        debug!(forwarded, "Block feed channel closed");
        forwarded
    })
}
