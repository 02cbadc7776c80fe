//! chainevents-storage: durable checkpoints for ChainEvents.
//!
//! - [`file`]: one locked JSON file per checkpoint target
//!
//! The in-memory checkpoint lives in `chainevents_core::checkpoint`.

pub mod file;

pub use file::{record_json, FileCheckpoint, CHECKPOINT_VERSION};
