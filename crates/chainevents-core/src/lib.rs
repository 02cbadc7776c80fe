//! chainevents-core: block and commit event dispatch for one channel.
//!
//! # Architecture
//!
//! ```text
//! NetworkBuilder → NetworkSession
//!                      ├── BlockDispatcher  (per-listener cursor, dedup, checkpoints)
//!                      │       └── BlockEventSource (one subscription per session)
//!                      ├── CommitTracker    (one tx id on a peer set)
//!                      │       └── PeerDisconnectSource (one per peer)
//!                      └── CommitWaiter     (async wait on top of the tracker)
//! ```
//!
//! Checkpoints implement [`Checkpoint`]; [`MemoryCheckpoint`] lives here and
//! the file-backed one in `chainevents-storage`.

pub mod builder;
pub mod checkpoint;
pub mod commit;
pub mod config;
pub mod dispatcher;
pub mod error;
mod gate;
pub mod listener;
pub mod network;
pub mod source;
pub mod types;
pub mod waiter;

pub use builder::NetworkBuilder;
pub use checkpoint::{Checkpoint, CheckpointState, MemoryCheckpoint, TransactionIds};
pub use commit::CommitTracker;
pub use config::NetworkConfig;
pub use dispatcher::{BlockDispatcher, ListenOptions};
pub use error::{CheckpointError, EventError};
pub use listener::{BlockListener, CommitListener, DisconnectListener, TransactionListener};
pub use network::NetworkSession;
pub use source::{
    pump_blocks, pump_disconnects, spawn_block_feed, BlockEventSource, FanoutBlockSource,
    FanoutDisconnectSource, PeerDisconnectSource, SubscriptionId,
};
pub use types::{BlockEvent, PeerDisconnectEvent, PeerRef, TransactionEvent, ValidationCode};
pub use waiter::{CommitOutcome, CommitStrategy, CommitWaiter};
