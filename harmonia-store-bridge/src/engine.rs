// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! The store engine boundary.
//!
//! A [`StoreEngine`] is the synchronous collaborator behind a
//! [`StoreHandle`](crate::StoreHandle). Every method may block on disk or
//! database I/O and is only ever called from the blocking thread pool.

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::SystemTime;

use thiserror::Error;

use crate::config::Config;
use crate::error::ConfigError;
use crate::store_path::{ParseStorePathError, StoreDir, StorePath};

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors raised inside an engine. These never reach callers of the handle;
/// they are translated into [`crate::Error`] at the boundary.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("path '{0}' is not valid")]
    InvalidPath(String),

    /// A path reached through the graph has no record of its own.
    #[error("path '{0}' is referenced but not valid")]
    DanglingReference(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Database not found at: {0}")]
    DatabaseNotFound(PathBuf),

    #[error("Failed to open database at '{path}': {source}")]
    DatabaseOpen {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("corrupt store metadata: {0}")]
    Corrupt(#[from] ParseStorePathError),

    #[error("{0}")]
    Unsupported(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// The engine's authoritative record for one valid path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfo {
    pub path: StorePath,
    /// `<algo>:<digest>` as recorded, usually base16 SHA-256
    pub nar_hash: String,
    pub nar_size: Option<u64>,
    pub deriver: Option<StorePath>,
    /// In the store's own order.
    pub references: Vec<StorePath>,
    /// In the store's own order; opaque `<key name>:<signature>` strings.
    pub signatures: Vec<String>,
    pub registration_time: SystemTime,
    /// Built locally rather than substituted.
    pub ultimate: bool,
    pub ca: Option<String>,
}

/// Synchronous store primitives.
pub trait StoreEngine: Send + Sync + 'static {
    fn store_dir(&self) -> &StoreDir;

    /// `None` if the path is not valid.
    fn query_path_info(&self, path: &StorePath) -> EngineResult<Option<PathInfo>>;

    fn is_valid_path(&self, path: &StorePath) -> EngineResult<bool> {
        Ok(self.query_path_info(path)?.is_some())
    }

    /// Valid paths whose references include `path`.
    fn query_referrers(&self, path: &StorePath) -> EngineResult<Vec<StorePath>>;

    /// Output paths recorded for a derivation. They need not be valid.
    fn query_derivation_outputs(&self, drv: &StorePath) -> EngineResult<Vec<StorePath>>;

    /// Valid derivations that list `path` as one of their outputs.
    fn query_valid_derivers(&self, path: &StorePath) -> EngineResult<Vec<StorePath>>;

    fn query_path_from_hash_part(&self, hash_part: &str) -> EngineResult<Option<StorePath>>;

    /// Serialize `path` as a NAR into `sink`.
    ///
    /// Writes happen in a tight loop; the method returns once the last byte
    /// has been handed to `sink`. A write error from the sink aborts the dump
    /// and is returned as [`EngineError::Io`].
    fn nar_from_path(&self, path: &StorePath, sink: &mut dyn Write) -> EngineResult<()>;
}

/// An engine that can be opened from configuration.
pub trait StoreBackend: StoreEngine + Sized {
    /// Process-wide setup. Called at most once per process, before the first
    /// [`StoreBackend::open`], under a global lock.
    fn init_process() -> EngineResult<()>;

    fn open(config: &Config) -> EngineResult<Self>;
}
