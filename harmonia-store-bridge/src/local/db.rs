// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Connections to the store database and the queries run on them.
//!
//! Every query takes and returns full paths exactly as the `ValidPaths` table
//! records them; translating those into [`StorePath`](crate::StorePath)s is
//! the caller's job.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use tracing::debug;

use super::schema::SCHEMA_SQL;
use crate::engine::{EngineError, EngineResult};

/// How long a reader waits on a lock held by a running `nix-daemon`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(60);

/// One `ValidPaths` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRow {
    pub id: i64,
    pub path: String,
    pub hash: String,
    pub registration_time: SystemTime,
    pub deriver: Option<String>,
    pub nar_size: Option<u64>,
    pub ultimate: bool,
    pub sigs: Option<String>,
    pub ca: Option<String>,
}

impl PathRow {
    /// Signatures in recorded order.
    pub fn signatures(&self) -> Vec<String> {
        self.sigs
            .as_deref()
            .map(|s| s.split_whitespace().map(String::from).collect())
            .unwrap_or_default()
    }
}

pub struct StoreDb {
    pub(super) conn: Connection,
}

impl StoreDb {
    /// Open an existing database for reading.
    ///
    /// Unlike an `immutable=1` open, this sees paths registered by a running
    /// daemon after the connection was made.
    pub fn open_read_only(path: &Path) -> EngineResult<Self> {
        if !path.exists() {
            return Err(EngineError::DatabaseNotFound(path.to_owned()));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| EngineError::DatabaseOpen {
            path: path.to_owned(),
            source: e,
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        debug!("opened store database at {} (read-only)", path.display());
        Ok(Self { conn })
    }

    /// Create (or open) a writable database with the schema in place.
    pub fn create(path: &Path) -> EngineResult<Self> {
        let conn = Connection::open(path).map_err(|e| EngineError::DatabaseOpen {
            path: path.to_owned(),
            source: e,
        })?;
        let db = Self { conn };
        db.init_schema()?;
        debug!("created store database at {}", path.display());
        Ok(db)
    }

    pub fn open_memory() -> EngineResult<Self> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> EngineResult<()> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    pub fn has_schema(&self) -> EngineResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'ValidPaths'",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn query_path_row(&self, path: &str) -> EngineResult<Option<PathRow>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT id, path, hash, registrationTime, deriver, narSize, ultimate, sigs, ca
            FROM ValidPaths
            WHERE path = ?1
            "#,
        )?;
        let row = stmt
            .query_row(params![path], |row| {
                Ok(PathRow {
                    id: row.get(0)?,
                    path: row.get(1)?,
                    hash: row.get(2)?,
                    registration_time: from_unix(row.get(3)?),
                    deriver: row.get::<_, Option<String>>(4)?.filter(|d| !d.is_empty()),
                    nar_size: row.get::<_, Option<i64>>(5)?.map(|n| n as u64),
                    ultimate: row.get::<_, Option<i64>>(6)?.unwrap_or(0) != 0,
                    sigs: row.get(7)?,
                    ca: row.get::<_, Option<String>>(8)?.filter(|ca| !ca.is_empty()),
                })
            })
            .optional()?;
        Ok(row)
    }

    /// References of the path with row id `id`, sorted by path.
    pub fn query_references(&self, id: i64) -> EngineResult<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT v.path
            FROM Refs r
            JOIN ValidPaths v ON r.reference = v.id
            WHERE r.referrer = ?1
            ORDER BY v.path
            "#,
        )?;
        collect_paths(stmt.query(params![id])?)
    }

    pub fn query_referrers(&self, path: &str) -> EngineResult<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT v.path
            FROM Refs r
            JOIN ValidPaths v ON r.referrer = v.id
            WHERE r.reference = (SELECT id FROM ValidPaths WHERE path = ?1)
            ORDER BY v.path
            "#,
        )?;
        collect_paths(stmt.query(params![path])?)
    }

    pub fn is_valid_path(&self, path: &str) -> EngineResult<bool> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT 1 FROM ValidPaths WHERE path = ?1 LIMIT 1")?;
        Ok(stmt.exists(params![path])?)
    }

    /// Valid derivations recording `output` as one of their outputs.
    pub fn query_valid_derivers(&self, output: &str) -> EngineResult<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT v.path
            FROM DerivationOutputs d
            JOIN ValidPaths v ON d.drv = v.id
            WHERE d.path = ?1
            ORDER BY v.path
            "#,
        )?;
        collect_paths(stmt.query(params![output])?)
    }

    /// Output paths recorded for `drv`, valid or not.
    pub fn query_derivation_outputs(&self, drv: &str) -> EngineResult<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT d.path
            FROM DerivationOutputs d
            JOIN ValidPaths v ON d.drv = v.id
            WHERE v.path = ?1
            ORDER BY d.id
            "#,
        )?;
        collect_paths(stmt.query(params![drv])?)
    }

    /// First valid path starting with `<store_dir>/<hash_part>`.
    pub fn query_path_from_hash_part(
        &self,
        store_dir: &str,
        hash_part: &str,
    ) -> EngineResult<Option<String>> {
        let prefix = format!("{store_dir}/{hash_part}");
        let mut stmt = self
            .conn
            .prepare_cached("SELECT path FROM ValidPaths WHERE path >= ?1 LIMIT 1")?;
        let path: Option<String> = stmt
            .query_row(params![&prefix], |row| row.get(0))
            .optional()?;
        Ok(path.filter(|p| p.starts_with(&prefix)))
    }
}

fn collect_paths(mut rows: rusqlite::Rows<'_>) -> EngineResult<Vec<String>> {
    let mut paths = Vec::new();
    while let Some(row) = rows.next()? {
        paths.push(row.get(0)?);
    }
    Ok(paths)
}

pub(super) fn from_unix(timestamp: i64) -> SystemTime {
    if timestamp >= 0 {
        UNIX_EPOCH + Duration::from_secs(timestamp as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(timestamp.unsigned_abs())
    }
}

pub(super) fn to_unix(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}
