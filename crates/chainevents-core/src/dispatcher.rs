//! Block dispatcher: fans block events out to registered listeners.
//!
//! Each registration keeps its own cursor, so listeners that joined at
//! different points (live, replay, checkpoint resume) are evaluated
//! independently. For a given listener:
//!
//! - a block numbered below its cursor is stale and dropped,
//! - a block numbered equal to its cursor is a duplicate and dropped (this
//!   is how the same block arriving from several peers is delivered once),
//! - anything higher is delivered and becomes the new cursor.
//!
//! There is no reordering buffer: a lower block that arrives after a higher
//! one is never delivered.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error, info};

use crate::checkpoint::Checkpoint;
use crate::error::EventError;
use crate::gate::Gate;
use crate::listener::{call_listener, listener_key, BlockListener, TransactionListener};
use crate::source::{BlockEventSource, SubscriptionId};
use crate::types::BlockEvent;

// ─── ListenOptions ────────────────────────────────────────────────────────────

/// Where a new listener starts.
///
/// A checkpoint holding a block number wins; otherwise `start_block`
/// applies; with neither, the listener starts with the next block it sees.
#[derive(Clone, Default)]
pub struct ListenOptions {
    checkpoint: Option<Arc<dyn Checkpoint>>,
    start_block: Option<u64>,
}

impl ListenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist progress to `checkpoint` and resume from it.
    pub fn checkpoint(mut self, checkpoint: Arc<dyn Checkpoint>) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Replay from `block` (inclusive).
    pub fn start_block(mut self, block: u64) -> Self {
        self.start_block = Some(block);
        self
    }
}

impl std::fmt::Debug for ListenOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenOptions")
            .field("checkpoint", &self.checkpoint.as_ref().map(|cp| cp.block_number()))
            .field("start_block", &self.start_block)
            .finish()
    }
}

// ─── Registration ─────────────────────────────────────────────────────────────

/// A listener's position in the block stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    /// Nothing delivered yet; accept the next block seen.
    Live,
    /// Replay: accept blocks at or above this number.
    From(u64),
    /// Accept only blocks above this number.
    After(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Deliver,
    /// Same block as the checkpoint; deliver the transactions not yet recorded.
    Resume,
    Stale,
    Duplicate,
}

enum Sink {
    Block(Arc<dyn BlockListener>),
    Transactions(Arc<dyn TransactionListener>),
}

struct RegistrationState {
    sink: Sink,
    position: Position,
    checkpoint: Option<Arc<dyn Checkpoint>>,
    resume_block: Option<u64>,
}

impl RegistrationState {
    fn new(sink: Sink, options: ListenOptions) -> Self {
        let checkpointed = options.checkpoint.as_ref().and_then(|cp| cp.block_number());
        let position = match (checkpointed, options.start_block) {
            (Some(block), _) => Position::After(block),
            (None, Some(start)) => Position::From(start),
            (None, None) => Position::Live,
        };
        let resume_block = match sink {
            Sink::Transactions(_) => checkpointed,
            Sink::Block(_) => None,
        };
        Self {
            sink,
            position,
            checkpoint: options.checkpoint,
            resume_block,
        }
    }

    fn admit(&self, block_number: u64) -> Admission {
        match self.position {
            Position::Live => Admission::Deliver,
            Position::From(start) if block_number < start => Admission::Stale,
            Position::From(_) => Admission::Deliver,
            Position::After(last) if block_number > last => Admission::Deliver,
            Position::After(last) if block_number == last => {
                if self.resume_block == Some(block_number) {
                    Admission::Resume
                } else {
                    Admission::Duplicate
                }
            }
            Position::After(_) => Admission::Stale,
        }
    }

    /// `still_open` reports whether the registration is still live; a
    /// listener may remove itself part way through a block.
    fn deliver(&mut self, block: &BlockEvent, channel: &str, still_open: &dyn Fn() -> bool) {
        let block_number = block.block_number;
        match self.admit(block_number) {
            Admission::Stale => {
                debug!(channel, block = block_number, peer = %block.peer, "Dropping stale block");
            }
            Admission::Duplicate => {
                debug!(channel, block = block_number, peer = %block.peer, "Dropping duplicate block");
            }
            Admission::Resume => {
                self.resume_block = None;
                debug!(channel, block = block_number, "Resuming partially processed block");
                self.deliver_transactions(block, channel, true, still_open);
            }
            Admission::Deliver => {
                // Record before delivering so the checkpoint never lags behind
                // what the listener has seen.
                if let Some(checkpoint) = &self.checkpoint {
                    if let Err(e) = checkpoint.set_block_number(block_number) {
                        error!(channel, block = block_number, error = %e, "Checkpoint update failed; block not delivered");
                        return;
                    }
                }
                self.position = Position::After(block_number);
                self.resume_block = None;
                match &self.sink {
                    Sink::Block(listener) => {
                        call_listener(channel, "block", || listener.accept(block));
                    }
                    Sink::Transactions(_) => {
                        self.deliver_transactions(block, channel, false, still_open)
                    }
                }
            }
        }
    }

    fn deliver_transactions(
        &self,
        block: &BlockEvent,
        channel: &str,
        skip_recorded: bool,
        still_open: &dyn Fn() -> bool,
    ) {
        let Sink::Transactions(listener) = &self.sink else {
            return;
        };
        let recorded = match (&self.checkpoint, skip_recorded) {
            (Some(checkpoint), true) => checkpoint.transaction_ids(),
            _ => Default::default(),
        };
        for transaction in &block.transactions {
            if !still_open() {
                break;
            }
            if recorded.contains(&transaction.transaction_id) {
                continue;
            }
            if let Some(checkpoint) = &self.checkpoint {
                if let Err(e) = checkpoint.add_transaction_id(&transaction.transaction_id) {
                    error!(
                        channel,
                        block = block.block_number,
                        transaction_id = %transaction.transaction_id,
                        error = %e,
                        "Checkpoint update failed; remaining transactions not delivered"
                    );
                    return;
                }
            }
            call_listener(channel, "transaction", || listener.accept(transaction));
        }
    }
}

struct Registration {
    key: usize,
    gate: Gate<RegistrationState>,
}

// ─── BlockDispatcher ──────────────────────────────────────────────────────────

#[derive(Default)]
struct Sequencer {
    queue: VecDeque<BlockEvent>,
    draining: bool,
}

/// Delivers block events from one network's source to its listeners.
///
/// Events are processed one at a time: an event arriving while another is
/// being delivered (from another thread, or from inside a listener) is
/// queued and delivered by the thread already draining the queue.
pub struct BlockDispatcher {
    channel: String,
    source: Arc<dyn BlockEventSource>,
    subscription: Mutex<Option<SubscriptionId>>,
    registrations: Mutex<Vec<Arc<Registration>>>,
    sequencer: Mutex<Sequencer>,
    closed: AtomicBool,
}

/// The dispatcher's subscription on the block source.
struct SourceFeed {
    dispatcher: Weak<BlockDispatcher>,
}

impl BlockListener for SourceFeed {
    fn accept(&self, block: &BlockEvent) -> Result<(), EventError> {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.on_block_event(block.clone());
        }
        Ok(())
    }
}

impl BlockDispatcher {
    /// Create a dispatcher and subscribe it to `source`.
    pub fn start(channel: impl Into<String>, source: Arc<dyn BlockEventSource>) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            channel: channel.into(),
            source: Arc::clone(&source),
            subscription: Mutex::new(None),
            registrations: Mutex::new(vec![]),
            sequencer: Mutex::new(Sequencer::default()),
            closed: AtomicBool::new(false),
        });
        let feed = Arc::new(SourceFeed {
            dispatcher: Arc::downgrade(&dispatcher),
        });
        let id = source.subscribe(feed);
        *dispatcher.subscription.lock().unwrap() = Some(id);
        info!(channel = %dispatcher.channel, subscription = %id, "Block dispatcher started");
        dispatcher
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Register a block listener. Returns the same listener value.
    ///
    /// Registering a listener that is already registered replaces its
    /// previous registration.
    pub fn add_listener<L>(&self, listener: Arc<L>, options: ListenOptions) -> Result<Arc<L>, EventError>
    where
        L: BlockListener + 'static,
    {
        let sink = Sink::Block(Arc::clone(&listener) as Arc<dyn BlockListener>);
        self.register(listener_key(&listener), sink, options)?;
        Ok(listener)
    }

    /// Register a listener that receives each transaction of accepted blocks.
    pub fn add_transaction_listener<L>(
        &self,
        listener: Arc<L>,
        options: ListenOptions,
    ) -> Result<Arc<L>, EventError>
    where
        L: TransactionListener + 'static,
    {
        let sink = Sink::Transactions(Arc::clone(&listener) as Arc<dyn TransactionListener>);
        self.register(listener_key(&listener), sink, options)?;
        Ok(listener)
    }

    fn register(&self, key: usize, sink: Sink, options: ListenOptions) -> Result<(), EventError> {
        let registration = Arc::new(Registration {
            key,
            gate: Gate::new(RegistrationState::new(sink, options)),
        });
        let replaced = {
            let mut registrations = self.registrations.lock().unwrap();
            if self.is_closed() {
                return Err(EventError::SessionClosed {
                    channel: self.channel.clone(),
                });
            }
            let replaced = registrations
                .iter()
                .position(|r| r.key == key)
                .map(|pos| registrations.remove(pos));
            registrations.push(registration);
            replaced
        };
        if let Some(previous) = replaced {
            previous.gate.close();
            debug!(channel = %self.channel, "Replaced existing listener registration");
        }
        Ok(())
    }

    /// Remove a listener. Returns `false` if it was not registered.
    ///
    /// Once this returns, the listener receives no further callbacks.
    pub fn remove_listener<L: ?Sized>(&self, listener: &Arc<L>) -> bool {
        let key = listener_key(listener);
        let removed = {
            let mut registrations = self.registrations.lock().unwrap();
            registrations
                .iter()
                .position(|r| r.key == key)
                .map(|pos| registrations.remove(pos))
        };
        match removed {
            Some(registration) => {
                registration.gate.close();
                true
            }
            None => false,
        }
    }

    /// Number of active registrations.
    pub fn listener_count(&self) -> usize {
        self.registrations.lock().unwrap().len()
    }

    /// Accept one inbound event from the source.
    pub fn on_block_event(&self, block: BlockEvent) {
        if self.is_closed() {
            return;
        }
        {
            let mut sequencer = self.sequencer.lock().unwrap();
            sequencer.queue.push_back(block);
            if sequencer.draining {
                return;
            }
            sequencer.draining = true;
        }
        loop {
            let next = {
                let mut sequencer = self.sequencer.lock().unwrap();
                if self.is_closed() {
                    sequencer.queue.clear();
                }
                match sequencer.queue.pop_front() {
                    Some(block) => block,
                    None => {
                        sequencer.draining = false;
                        return;
                    }
                }
            };
            self.dispatch(&next);
        }
    }

    fn dispatch(&self, block: &BlockEvent) {
        let registrations: Vec<Arc<Registration>> = self.registrations.lock().unwrap().clone();
        for registration in registrations {
            let gate = &registration.gate;
            gate.enter(|state| state.deliver(block, &self.channel, &|| gate.is_open()));
        }
    }

    /// Unsubscribe from the source and drop every registration.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(id) = self.subscription.lock().unwrap().take() {
            self.source.unsubscribe(id);
        }
        let drained: Vec<Arc<Registration>> = self.registrations.lock().unwrap().drain(..).collect();
        for registration in &drained {
            registration.gate.close();
        }
        info!(channel = %self.channel, removed = drained.len(), "Block dispatcher closed");
    }
}

impl Drop for BlockDispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
