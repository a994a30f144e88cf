// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! A [`StoreEngine`] over a local Nix store: its SQLite database and the
//! store directory on disk.

mod db;
mod schema;
mod write;

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use tracing::{debug, info};

pub use db::{PathRow, StoreDb};
pub use write::RegisterPathParams;

use crate::config::Config;
use crate::engine::{EngineError, EngineResult, PathInfo, StoreBackend, StoreEngine};
use crate::nar;
use crate::store_path::{StoreDir, StorePath};

/// Oldest SQLite that can read a WAL database without write access.
const MIN_SQLITE_VERSION: i32 = 3_022_000;

/// Connections kept open between queries; extra ones are closed on return.
const MAX_IDLE_CONNECTIONS: usize = 16;

pub struct LocalStore {
    store_dir: StoreDir,
    physical_dir: PathBuf,
    db_path: PathBuf,
    /// Idle read-only connections; one is taken per query.
    pool: Mutex<Vec<StoreDb>>,
}

impl LocalStore {
    fn with_db<T>(&self, f: impl FnOnce(&StoreDb) -> EngineResult<T>) -> EngineResult<T> {
        let idle = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let db = match idle {
            Some(db) => db,
            None => StoreDb::open_read_only(&self.db_path)?,
        };
        let result = f(&db);
        let mut idle = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(db);
        }
        result
    }

    fn parse(&self, full: &str) -> EngineResult<StorePath> {
        Ok(self.store_dir.parse_path(full)?)
    }

    fn parse_all(&self, paths: Vec<String>) -> EngineResult<Vec<StorePath>> {
        paths.iter().map(|p| self.parse(p)).collect()
    }
}

impl StoreEngine for LocalStore {
    fn store_dir(&self) -> &StoreDir {
        &self.store_dir
    }

    fn query_path_info(&self, path: &StorePath) -> EngineResult<Option<PathInfo>> {
        let full = self.store_dir.print_path(path);
        self.with_db(|db| {
            let Some(row) = db.query_path_row(&full)? else {
                return Ok(None);
            };
            let references = self.parse_all(db.query_references(row.id)?)?;
            let deriver = row.deriver.as_deref().map(|d| self.parse(d)).transpose()?;
            Ok(Some(PathInfo {
                path: path.clone(),
                signatures: row.signatures(),
                nar_hash: row.hash,
                nar_size: row.nar_size,
                deriver,
                references,
                registration_time: row.registration_time,
                ultimate: row.ultimate,
                ca: row.ca,
            }))
        })
    }

    fn is_valid_path(&self, path: &StorePath) -> EngineResult<bool> {
        let full = self.store_dir.print_path(path);
        self.with_db(|db| db.is_valid_path(&full))
    }

    fn query_referrers(&self, path: &StorePath) -> EngineResult<Vec<StorePath>> {
        let full = self.store_dir.print_path(path);
        let referrers = self.with_db(|db| db.query_referrers(&full))?;
        self.parse_all(referrers)
    }

    fn query_derivation_outputs(&self, drv: &StorePath) -> EngineResult<Vec<StorePath>> {
        let full = self.store_dir.print_path(drv);
        let outputs = self.with_db(|db| db.query_derivation_outputs(&full))?;
        self.parse_all(outputs)
    }

    fn query_valid_derivers(&self, path: &StorePath) -> EngineResult<Vec<StorePath>> {
        let full = self.store_dir.print_path(path);
        let derivers = self.with_db(|db| db.query_valid_derivers(&full))?;
        self.parse_all(derivers)
    }

    fn query_path_from_hash_part(&self, hash_part: &str) -> EngineResult<Option<StorePath>> {
        let found = self.with_db(|db| {
            db.query_path_from_hash_part(self.store_dir.to_str(), hash_part)
        })?;
        found.map(|p| self.parse(&p)).transpose()
    }

    fn nar_from_path(&self, path: &StorePath, sink: &mut dyn Write) -> EngineResult<()> {
        if !self.is_valid_path(path)? {
            return Err(EngineError::InvalidPath(self.store_dir.print_path(path)));
        }
        let location = self.physical_dir.join(path.as_str());
        debug!("dumping {} from {}", path, location.display());
        nar::dump(&location, sink)
    }
}

impl StoreBackend for LocalStore {
    fn init_process() -> EngineResult<()> {
        let version = rusqlite::version_number();
        if version < MIN_SQLITE_VERSION {
            return Err(EngineError::Unsupported(format!(
                "SQLite {} is too old to read a live Nix database",
                rusqlite::version()
            )));
        }
        info!("using SQLite {}", rusqlite::version());
        Ok(())
    }

    fn open(config: &Config) -> EngineResult<Self> {
        let store_dir = config.store_dir()?;
        let db_path = config.db_path();
        let db = StoreDb::open_read_only(&db_path)?;
        if !db.has_schema()? {
            return Err(EngineError::Unsupported(format!(
                "{} is not a Nix store database",
                db_path.display()
            )));
        }
        info!(
            "opened local store {} (database {})",
            store_dir,
            db_path.display()
        );
        Ok(Self {
            store_dir,
            physical_dir: config.physical_store_dir().to_path_buf(),
            db_path,
            pool: Mutex::new(vec![db]),
        })
    }
}
