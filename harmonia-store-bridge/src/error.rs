// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Error types returned by the store handle.

use std::path::PathBuf;

use thiserror::Error;

use crate::engine::EngineError;
use crate::store_path::{ParseStorePathError, StorePath};

pub type Result<T> = std::result::Result<T, Error>;

/// Everything a [`StoreHandle`](crate::StoreHandle) operation can fail with.
///
/// Engine errors are flattened into messages here so that no backend type
/// leaks through the public API.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    #[error("Invalid store path: {0}")]
    InvalidPathFormat(#[from] ParseStorePathError),

    #[error("path '{0}' is not valid")]
    PathNotFound(StorePath),

    #[error("Failed to {operation} '{path}': {reason}")]
    StoreQuery {
        operation: &'static str,
        path: String,
        reason: String,
    },

    #[error("Failed to stream NAR of '{path}': {reason}")]
    ArchiveStream { path: StorePath, reason: String },
}

impl Error {
    pub(crate) fn unavailable(reason: impl std::fmt::Display) -> Self {
        Self::StoreUnavailable {
            reason: reason.to_string(),
        }
    }

    /// Translate an engine error raised while querying `path`.
    pub(crate) fn query(operation: &'static str, path: &StorePath, err: EngineError) -> Self {
        match err {
            EngineError::InvalidPath(_) => Self::PathNotFound(path.clone()),
            err => Self::StoreQuery {
                operation,
                path: path.to_string(),
                reason: err.to_string(),
            },
        }
    }

    /// Translate an engine error raised while serializing `path`.
    pub(crate) fn archive(path: &StorePath, err: EngineError) -> Self {
        match err {
            EngineError::InvalidPath(_) => Self::PathNotFound(path.clone()),
            err => Self::ArchiveStream {
                path: path.clone(),
                reason: err.to_string(),
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::PathNotFound(_))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid configuration: {reason}")]
    Invalid { reason: String },
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::unavailable(err)
    }
}
