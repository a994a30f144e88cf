// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Store handle configuration.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::ConfigError;
use crate::store_path::StoreDir;

/// Environment variable naming a TOML config file.
pub const CONFIG_ENV: &str = "HARMONIA_STORE_CONFIG";

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Logical store directory, as it appears in store paths
    pub store_dir: PathBuf,

    /// Where the store actually lives on disk, if not at `store_dir`
    pub real_store_dir: Option<PathBuf>,

    /// Nix state directory; the database lives at `<state_dir>/db/db.sqlite`
    pub state_dir: PathBuf,

    /// Explicit database path, overriding `state_dir`
    pub db_path: Option<PathBuf>,

    /// Size of the chunks an archive stream is cut into
    pub chunk_size: usize,

    /// Chunks buffered between the producer and the consumer
    pub channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("/nix/store"),
            real_store_dir: None,
            state_dir: PathBuf::from("/nix/var/nix"),
            db_path: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl Config {
    /// Defaults, or the file named by `HARMONIA_STORE_CONFIG`, with
    /// `NIX_STORE_DIR` and `NIX_STATE_DIR` applied on top.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(file) => Self::from_file(Path::new(&file))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var_os(key));
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("loading store config from {}", path.display());
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(toml::from_str(&contents)?)
    }

    /// Apply the Nix environment overrides, looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<OsString>) {
        if let Some(dir) = var("NIX_STORE_DIR").filter(|v| !v.is_empty()) {
            self.store_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("NIX_STATE_DIR").filter(|v| !v.is_empty()) {
            self.state_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(invalid("chunk_size must be greater than 0"));
        }
        if self.channel_capacity == 0 {
            return Err(invalid("channel_capacity must be greater than 0"));
        }
        self.store_dir()?;
        Ok(())
    }

    pub fn store_dir(&self) -> Result<StoreDir, ConfigError> {
        let dir = self.store_dir.to_str().ok_or_else(|| {
            invalid(format!(
                "store_dir is not valid UTF-8: {}",
                self.store_dir.display()
            ))
        })?;
        StoreDir::new(dir).map_err(|e| invalid(e.to_string()))
    }

    /// The directory store paths are read from on disk.
    pub fn physical_store_dir(&self) -> &Path {
        self.real_store_dir.as_deref().unwrap_or(&self.store_dir)
    }

    pub fn db_path(&self) -> PathBuf {
        match &self.db_path {
            Some(path) => path.clone(),
            None => self.state_dir.join("db").join("db.sqlite"),
        }
    }
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.into(),
    }
}
