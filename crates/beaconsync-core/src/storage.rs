//! Durable flat key-value storage.
//!
//! Configuration and the latest cycle state are kept as flat string/long
//! entries in a single JSON file so that observers can show the last-known
//! status before the scheduler re-attaches after a restart.
//!
//! Commits are whole-file: the map is written to a sibling temp file and
//! renamed over the original, so a crash mid-write leaves the previous
//! snapshot intact. Inside a multi-threaded runtime the write is done via
//! `block_in_place`, so the calling task's worker hands its other tasks off
//! while the disk is busy.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::error::Result;

// block_in_place panics on a current-thread runtime, so it is only used
// where the runtime can move other tasks to another worker.
fn off_worker<T>(io: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(io)
        }
        _ => io(),
    }
}

/// File name of the store inside the data directory.
pub const STORE_FILE_NAME: &str = "beaconsync.json";

/// Errors raised by [`KvStore`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// The store file exists but could not be read.
    #[error("failed to read {path}: {source}")]
    ReadError {
        /// Store path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The store could not be written.
    #[error("failed to write {path}: {source}")]
    WriteError {
        /// Store path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The store file is not valid JSON.
    #[error("failed to parse {path}: {source}")]
    ParseError {
        /// Store path.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// The in-memory map could not be serialized.
    #[error("failed to serialize store: {0}")]
    SerializeError(#[from] serde_json::Error),
}

/// A single stored value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KvValue {
    /// Integer value (timestamps, counters).
    Long(i64),
    /// String value.
    Str(String),
}

impl From<&str> for KvValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for KvValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for KvValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

/// Flat key-value store backed by a JSON file (or nothing, for tests).
#[derive(Debug)]
pub struct KvStore {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, KvValue>>,
}

impl KvStore {
    /// Open the store at `path`, loading existing entries if the file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> std::result::Result<Self, StorageError> {
        let path = path.into();
        let entries = if path.exists() {
            let content =
                std::fs::read_to_string(&path).map_err(|source| StorageError::ReadError {
                    path: path.clone(),
                    source,
                })?;
            serde_json::from_str(&content).map_err(|source| StorageError::ParseError {
                path: path.clone(),
                source,
            })?
        } else {
            BTreeMap::new()
        };

        tracing::debug!(path = %path.display(), keys = entries.len(), "Opened key-value store");

        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    /// Open the store file inside `data_dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the store
    /// cannot be loaded.
    pub fn open_in(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        Ok(Self::open(data_dir.join(STORE_FILE_NAME))?)
    }

    /// Create a store that never touches disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read a string entry.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.entries.lock().get(key) {
            Some(KvValue::Str(s)) => Some(s.clone()),
            _ => None,
        }
    }

    /// Read an integer entry.
    #[must_use]
    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.entries.lock().get(key) {
            Some(KvValue::Long(n)) => Some(*n),
            _ => None,
        }
    }

    /// Apply a batch of writes and removals and commit them in one step.
    ///
    /// `None` values remove the key.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit to disk fails. The in-memory map is
    /// updated regardless so readers keep seeing the latest values.
    pub fn apply<I, K>(&self, changes: I) -> std::result::Result<(), StorageError>
    where
        I: IntoIterator<Item = (K, Option<KvValue>)>,
        K: Into<String>,
    {
        let mut entries = self.entries.lock();
        for (key, value) in changes {
            match value {
                Some(value) => {
                    entries.insert(key.into(), value);
                }
                None => {
                    entries.remove(&key.into());
                }
            }
        }
        off_worker(|| self.commit(&entries))
    }

    fn commit(&self, entries: &BTreeMap<String, KvValue>) -> std::result::Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let content = serde_json::to_string_pretty(entries)?;
        let tmp = path.with_extension("json.tmp");
        let write_err = |source| StorageError::WriteError {
            path: path.clone(),
            source,
        };
        std::fs::write(&tmp, content).map_err(write_err)?;
        std::fs::rename(&tmp, path).map_err(write_err)?;
        Ok(())
    }
}

/// Get the default data directory.
///
/// On Linux: `/var/lib/beaconsync`
/// Elsewhere: the platform data dir for `beaconsync`.
///
/// # Errors
///
/// Returns [`SyncError::DataDirUnavailable`] if no home directory is known.
pub fn default_data_dir() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/var/lib/beaconsync"))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let dirs = directories::ProjectDirs::from("", "", "beaconsync")
            .ok_or(crate::error::SyncError::DataDirUnavailable)?;
        Ok(dirs.data_dir().to_path_buf())
    }
}
