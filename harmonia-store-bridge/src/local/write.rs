// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Registering paths, for building stores in tests and tools.

use std::collections::BTreeSet;
use std::time::SystemTime;

use rusqlite::{OptionalExtension, params};

use super::db::{StoreDb, to_unix};
use crate::engine::EngineResult;

#[derive(Debug, Clone)]
pub struct RegisterPathParams {
    /// Full store path
    pub path: String,
    /// `<algo>:<digest>`
    pub hash: String,
    pub registration_time: SystemTime,
    pub deriver: Option<String>,
    pub nar_size: Option<u64>,
    pub ultimate: bool,
    /// Space-separated signatures
    pub sigs: Option<String>,
    pub ca: Option<String>,
    /// Full paths of already registered references; the path may list itself
    pub references: BTreeSet<String>,
}

impl Default for RegisterPathParams {
    fn default() -> Self {
        Self {
            path: String::new(),
            hash: String::new(),
            registration_time: SystemTime::now(),
            deriver: None,
            nar_size: None,
            ultimate: false,
            sigs: None,
            ca: None,
            references: BTreeSet::new(),
        }
    }
}

impl StoreDb {
    /// Register a path and its references in one transaction, returning its
    /// row id. References that are not registered are skipped.
    pub fn register_valid_path(&mut self, params: &RegisterPathParams) -> EngineResult<i64> {
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO ValidPaths (path, hash, registrationTime, deriver, narSize, ultimate, sigs, ca)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                params.path,
                params.hash,
                to_unix(params.registration_time),
                params.deriver,
                params.nar_size.map(|n| n as i64),
                i64::from(params.ultimate),
                params.sigs,
                params.ca,
            ],
        )?;
        let id = tx.last_insert_rowid();

        for reference in &params.references {
            let reference_id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM ValidPaths WHERE path = ?1",
                    params![reference],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(reference_id) = reference_id {
                tx.execute(
                    "INSERT OR REPLACE INTO Refs (referrer, reference) VALUES (?1, ?2)",
                    params![id, reference_id],
                )?;
            }
        }

        tx.commit()?;
        Ok(id)
    }

    /// Record `output_path` as output `output_id` of the registered `drv_path`.
    pub fn register_derivation_output(
        &self,
        drv_path: &str,
        output_id: &str,
        output_path: &str,
    ) -> EngineResult<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO DerivationOutputs (drv, id, path)
            SELECT v.id, ?2, ?3
            FROM ValidPaths v
            WHERE v.path = ?1
            "#,
            params![drv_path, output_id, output_path],
        )?;
        Ok(())
    }
}
