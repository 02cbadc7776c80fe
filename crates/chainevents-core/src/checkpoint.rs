//! Checkpoints: the listener's position in the chain, for resuming without
//! redelivery.
//!
//! A checkpoint stores the last block number handed to a listener and the
//! transaction ids already handled within that block. Setting a new block
//! number always clears the transaction ids.

use std::collections::BTreeSet;
use std::ops::Deref;
use std::sync::Mutex;

use crate::error::CheckpointError;

/// Read-only snapshot of the transaction ids recorded for the current block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionIds(BTreeSet<String>);

impl TransactionIds {
    pub fn into_inner(self) -> BTreeSet<String> {
        self.0
    }
}

impl Deref for TransactionIds {
    type Target = BTreeSet<String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'a> IntoIterator for &'a TransactionIds {
    type Item = &'a String;
    type IntoIter = std::collections::btree_set::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Trait implemented by checkpoint targets (in-memory, file-backed, ...).
///
/// A target may be held by one handle at a time. Implementations release
/// their target on `close` and again on drop if `close` was never called.
pub trait Checkpoint: Send + Sync {
    /// Last recorded block number, or `None` if unset.
    fn block_number(&self) -> Option<u64>;

    /// Transaction ids recorded for the current block number.
    fn transaction_ids(&self) -> TransactionIds;

    /// Record `block_number` and clear the transaction ids, even if the
    /// number is unchanged.
    fn set_block_number(&self, block_number: u64) -> Result<(), CheckpointError>;

    /// Mark a transaction within the current block as handled.
    fn add_transaction_id(&self, transaction_id: &str) -> Result<(), CheckpointError>;

    /// Release the checkpoint target. Further updates fail with
    /// [`CheckpointError::Closed`].
    fn close(&self) -> Result<(), CheckpointError> {
        Ok(())
    }
}

// ─── CheckpointState ──────────────────────────────────────────────────────────

/// The mutable state behind every checkpoint implementation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointState {
    block_number: Option<u64>,
    transaction_ids: BTreeSet<String>,
}

impl CheckpointState {
    /// State restored from persisted values.
    pub fn restore(block_number: Option<u64>, transaction_ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            block_number,
            transaction_ids: transaction_ids.into_iter().collect(),
        }
    }

    pub fn block_number(&self) -> Option<u64> {
        self.block_number
    }

    pub fn transaction_ids(&self) -> TransactionIds {
        TransactionIds(self.transaction_ids.clone())
    }

    pub fn set_block_number(&mut self, block_number: u64) {
        self.block_number = Some(block_number);
        self.transaction_ids.clear();
    }

    /// Returns `true` if the id was not already recorded.
    pub fn add_transaction_id(&mut self, transaction_id: &str) -> bool {
        self.transaction_ids.insert(transaction_id.to_string())
    }

    /// Clear both the block number and the transaction ids.
    pub fn reset(&mut self) {
        self.block_number = None;
        self.transaction_ids.clear();
    }
}

// ─── In-memory checkpoint ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryInner {
    state: CheckpointState,
    closed: bool,
}

/// Non-persistent checkpoint, useful for tests and for listeners that only
/// need to survive re-registration within one process.
#[derive(Debug, Default)]
pub struct MemoryCheckpoint {
    inner: Mutex<MemoryInner>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a known block number.
    pub fn at_block(block_number: u64) -> Self {
        let checkpoint = Self::default();
        checkpoint.inner.lock().unwrap().state.set_block_number(block_number);
        checkpoint
    }

    fn update<F>(&self, f: F) -> Result<(), CheckpointError>
    where
        F: FnOnce(&mut CheckpointState),
    {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(CheckpointError::Closed {
                target: "memory".into(),
            });
        }
        f(&mut inner.state);
        Ok(())
    }
}

impl Checkpoint for MemoryCheckpoint {
    fn block_number(&self) -> Option<u64> {
        self.inner.lock().unwrap().state.block_number()
    }

    fn transaction_ids(&self) -> TransactionIds {
        self.inner.lock().unwrap().state.transaction_ids()
    }

    fn set_block_number(&self, block_number: u64) -> Result<(), CheckpointError> {
        self.update(|state| state.set_block_number(block_number))
    }

    fn add_transaction_id(&self, transaction_id: &str) -> Result<(), CheckpointError> {
        self.update(|state| {
            state.add_transaction_id(transaction_id);
        })
    }

    fn close(&self) -> Result<(), CheckpointError> {
        self.inner.lock().unwrap().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_checkpoint_is_unset() {
        let checkpoint = MemoryCheckpoint::new();
        assert_eq!(checkpoint.block_number(), None);
        assert!(checkpoint.transaction_ids().is_empty());
    }

    #[test]
    fn set_block_number_clears_transactions() {
        let checkpoint = MemoryCheckpoint::new();
        checkpoint.add_transaction_id("tx1").unwrap();
        assert!(checkpoint.transaction_ids().contains("tx1"));

        checkpoint.set_block_number(1).unwrap();
        assert_eq!(checkpoint.block_number(), Some(1));
        assert!(checkpoint.transaction_ids().is_empty());
    }

    #[test]
    fn same_block_number_still_clears_transactions() {
        let checkpoint = MemoryCheckpoint::at_block(5);
        checkpoint.add_transaction_id("tx1").unwrap();
        checkpoint.set_block_number(5).unwrap();
        assert!(checkpoint.transaction_ids().is_empty());
    }

    #[test]
    fn transaction_ids_are_a_snapshot() {
        let checkpoint = MemoryCheckpoint::new();
        checkpoint.add_transaction_id("tx1").unwrap();
        let ids = checkpoint.transaction_ids();
        checkpoint.add_transaction_id("tx2").unwrap();

        assert_eq!(ids.len(), 1);
        assert_eq!(checkpoint.transaction_ids().len(), 2);
    }

    #[test]
    fn closed_checkpoint_rejects_updates() {
        let checkpoint = MemoryCheckpoint::at_block(3);
        checkpoint.close().unwrap();

        let err = checkpoint.set_block_number(4).unwrap_err();
        assert!(matches!(err, CheckpointError::Closed { .. }));
        assert_eq!(checkpoint.block_number(), Some(3));
    }

    #[test]
    fn state_reset() {
        let mut state = CheckpointState::restore(Some(9), vec!["a".to_string()]);
        assert!(!state.add_transaction_id("a"));
        assert!(state.add_transaction_id("b"));
        state.reset();
        assert_eq!(state, CheckpointState::default());
    }
}
