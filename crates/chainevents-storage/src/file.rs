//! File-backed checkpoint.
//!
//! One JSON record per file:
//!
//! ```json
//! { "version": 1, "blockNumber": 41, "transactionIds": ["tx1", "tx2"] }
//! ```
//!
//! `blockNumber` is `-1` while unset. The file is exclusively locked (via
//! `fs2`) for as long as the handle is open and is rewritten in place on
//! every update.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use chainevents_core::checkpoint::{Checkpoint, CheckpointState, TransactionIds};
use chainevents_core::error::CheckpointError;

/// Only supported record version.
pub const CHECKPOINT_VERSION: i64 = 1;

const UNSET_BLOCK: i64 = -1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointRecord {
    version: i64,
    #[serde(with = "block_number")]
    block_number: Option<u64>,
    transaction_ids: Vec<String>,
}

impl CheckpointRecord {
    fn from_state(state: &CheckpointState) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            block_number: state.block_number(),
            transaction_ids: state.transaction_ids().iter().cloned().collect(),
        }
    }
}

/// `blockNumber` spans the whole `u64` range; `-1` means unset.
mod block_number {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::UNSET_BLOCK;

    pub fn serialize<S: Serializer>(block: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match block {
            Some(n) => serializer.serialize_u64(*n),
            None => serializer.serialize_i64(UNSET_BLOCK),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Unsigned(u64),
            Signed(i64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Unsigned(n) => Ok(Some(n)),
            Raw::Signed(UNSET_BLOCK) => Ok(None),
            Raw::Signed(n) => Err(D::Error::custom(format!("negative block number {n}"))),
        }
    }
}

/// The record as it is written to disk, for display.
pub fn record_json(state: &CheckpointState) -> Result<Value, serde_json::Error> {
    serde_json::to_value(CheckpointRecord::from_state(state))
}

/// Parse the contents of a checkpoint file.
fn parse(path: &Path, data: &str) -> Result<CheckpointState, CheckpointError> {
    let value: Value = serde_json::from_str(data).map_err(|source| CheckpointError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let bad = |reason: String| CheckpointError::Format {
        path: path.to_path_buf(),
        reason,
    };

    let version = match value.get("version") {
        Some(v) => v
            .as_i64()
            .ok_or_else(|| bad(format!("version is not an integer: {v}")))?,
        None => return Err(bad("missing version".into())),
    };
    if version != CHECKPOINT_VERSION {
        return Err(CheckpointError::UnsupportedVersion {
            path: path.to_path_buf(),
            version,
        });
    }

    let record: CheckpointRecord =
        serde_json::from_value(value).map_err(|e| bad(e.to_string()))?;
    let block_number = record.block_number;
    if block_number.is_none() && !record.transaction_ids.is_empty() {
        return Err(bad("transaction ids recorded without a block number".into()));
    }
    Ok(CheckpointState::restore(block_number, record.transaction_ids))
}

struct FileInner {
    // `None` once closed.
    file: Option<File>,
    state: CheckpointState,
}

/// Durable checkpoint stored in a single locked JSON file.
pub struct FileCheckpoint {
    path: PathBuf,
    inner: Mutex<FileInner>,
}

impl FileCheckpoint {
    /// Open (or create) the checkpoint at `path` and lock it.
    ///
    /// Fails with [`CheckpointError::Locked`] if another handle holds the
    /// file, and with a parse, format or version error if the existing
    /// contents are not a valid record.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref().to_path_buf();
        let io = |source: std::io::Error| CheckpointError::Io {
            path: path.clone(),
            source,
        };

        let (mut file, created) = open_file(&path).map_err(io)?;
        if file.try_lock_exclusive().is_err() {
            return Err(CheckpointError::Locked { path: path.clone() });
        }

        // Decided under the lock: only a file this call created, and that is
        // still empty, is initialised. Dropping `file` on any error below
        // releases the lock.
        let mut data = String::new();
        file.read_to_string(&mut data).map_err(io)?;
        let state = if created && data.is_empty() {
            let state = CheckpointState::default();
            write_record(&mut file, &path, &state)?;
            state
        } else {
            parse(&path, &data)?
        };

        info!(
            path = %path.display(),
            block = ?state.block_number(),
            transactions = state.transaction_ids().len(),
            "Checkpoint opened"
        );
        Ok(Self {
            path,
            inner: Mutex::new(FileInner {
                file: Some(file),
                state,
            }),
        })
    }

    /// Read a checkpoint file without locking or creating it.
    pub fn load(path: impl AsRef<Path>) -> Result<CheckpointState, CheckpointError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        parse(path, &data)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> CheckpointState {
        self.inner.lock().unwrap().state.clone()
    }

    /// Clear the block number and transaction ids.
    pub fn reset(&self) -> Result<(), CheckpointError> {
        self.update(|state| {
            state.reset();
            true
        })
    }

    /// Apply `f` to a copy of the state and persist it. The in-memory state
    /// only changes if the write succeeds.
    fn update<F>(&self, f: F) -> Result<(), CheckpointError>
    where
        F: FnOnce(&mut CheckpointState) -> bool,
    {
        let mut inner = self.inner.lock().unwrap();
        let FileInner { file, state } = &mut *inner;
        let file = file.as_mut().ok_or_else(|| CheckpointError::Closed {
            target: self.path.display().to_string(),
        })?;

        let mut next = state.clone();
        if !f(&mut next) {
            return Ok(());
        }
        write_record(file, &self.path, &next)?;
        *state = next;
        Ok(())
    }
}

/// Open `path` for reading and writing, creating it if missing. Returns
/// whether this call created the file.
fn open_file(path: &Path) -> std::io::Result<(File, bool)> {
    match OpenOptions::new().read(true).write(true).create_new(true).open(path) {
        Ok(file) => Ok((file, true)),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            Ok((file, false))
        }
        Err(e) => Err(e),
    }
}

fn write_record(file: &mut File, path: &Path, state: &CheckpointState) -> Result<(), CheckpointError> {
    let io = |source: std::io::Error| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    };
    let data = serde_json::to_vec(&CheckpointRecord::from_state(state))
        .map_err(|e| io(e.into()))?;
    file.set_len(0).map_err(io)?;
    file.seek(SeekFrom::Start(0)).map_err(io)?;
    file.write_all(&data).map_err(io)?;
    file.sync_data().map_err(io)?;
    debug!(path = %path.display(), block = ?state.block_number(), "Checkpoint written");
    Ok(())
}

impl Checkpoint for FileCheckpoint {
    fn block_number(&self) -> Option<u64> {
        self.inner.lock().unwrap().state.block_number()
    }

    fn transaction_ids(&self) -> TransactionIds {
        self.inner.lock().unwrap().state.transaction_ids()
    }

    fn set_block_number(&self, block_number: u64) -> Result<(), CheckpointError> {
        self.update(|state| {
            state.set_block_number(block_number);
            true
        })
    }

    fn add_transaction_id(&self, transaction_id: &str) -> Result<(), CheckpointError> {
        self.update(|state| state.add_transaction_id(transaction_id))
    }

    fn close(&self) -> Result<(), CheckpointError> {
        let file = self.inner.lock().unwrap().file.take();
        if let Some(file) = file {
            file.unlock().map_err(|source| CheckpointError::Io {
                path: self.path.clone(),
                source,
            })?;
            debug!(path = %self.path.display(), "Checkpoint closed");
        }
        Ok(())
    }
}

impl Drop for FileCheckpoint {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            warn!(path = %self.path.display(), %error, "Failed to release checkpoint lock");
        }
    }
}

impl std::fmt::Debug for FileCheckpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCheckpoint").field("path", &self.path).finish()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
