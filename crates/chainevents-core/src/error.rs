//! Error types for event dispatch and checkpointing.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{PeerRef, ValidationCode};

/// Errors raised while opening or updating a checkpoint.
///
/// Every variant names the checkpoint target so callers can tell which
/// file (or in-memory cursor) failed.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("File is already locked: {}", path.display())]
    Locked { path: PathBuf },

    #[error("Failed to parse checkpoint data from {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Bad format of checkpoint data from {}: {reason}", path.display())]
    Format { path: PathBuf, reason: String },

    #[error("Unsupported checkpoint data version {version} from {}", path.display())]
    UnsupportedVersion { path: PathBuf, version: i64 },

    #[error("Checkpoint {target} is closed")]
    Closed { target: String },

    #[error("I/O error on checkpoint {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CheckpointError {
    /// Returns `true` if the error is a lock conflict on the checkpoint target.
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }
}

/// Errors surfaced by the network session, dispatcher and commit waiter.
#[derive(Debug, Error)]
pub enum EventError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("Network session for channel '{channel}' is closed")]
    SessionClosed { channel: String },

    #[error("Listener failed: {reason}")]
    Listener { reason: String },

    #[error("Timed out after {ms}ms waiting for commit of transaction {transaction_id}")]
    CommitTimeout { transaction_id: String, ms: u64 },

    #[error("Transaction {transaction_id} was rejected by peer {peer}: {code}")]
    CommitRejected {
        transaction_id: String,
        peer: PeerRef,
        code: ValidationCode,
    },

    #[error("No peer committed transaction {transaction_id}: every peer disconnected")]
    PeersDisconnected { transaction_id: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EventError {
    /// Convenience constructor for listener callbacks.
    pub fn listener(reason: impl Into<String>) -> Self {
        Self::Listener {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the error ended a commit wait (timeout, rejection
    /// or disconnect of every peer).
    pub fn is_commit_failure(&self) -> bool {
        matches!(
            self,
            Self::CommitTimeout { .. } | Self::CommitRejected { .. } | Self::PeersDisconnected { .. }
        )
    }
}
