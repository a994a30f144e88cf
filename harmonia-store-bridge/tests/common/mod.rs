// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! A throwaway local store: a store directory plus its database, in a
//! temporary directory.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use harmonia_store_bridge::local::{RegisterPathParams, StoreDb};
use harmonia_store_bridge::{Config, StoreHandle, nar};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

pub const FOO: &str = "l9r346p3d25vs4g5v37f3r3f28js97kb-foo";
pub const BAR: &str = "6cp643dzvlxxpkgbg5kzmwj47sam9zs2-bar";
pub const BAZ: &str = "4lmnzx45iy43kwjqn1xna7z3dj8grrz5-baz";
pub const QUX: &str = "awri8visnqf95b9ff0zbhj09spl83xrr-qux";
pub const APP_DRV: &str = "rr6yr3c4dwa7m36096p14dq9hnpy77zx-app.drv";
pub const APP: &str = "yyk596mhya1dp91k5hpanfmfcgrfczn1-app";
pub const DOC: &str = "1iyhcnwnp5f6fycmdy0yn57qcybvm5rx-doc";
pub const HELLO: &str = "r5aa819x9yn981068vcd1hdjglhs83nx-hello";
pub const MISSING: &str = "s891wb09b9y73ly63gci26w14wlciwyg-missing";

pub struct TestStore {
    pub dir: TempDir,
    pub config: Config,
    db: StoreDb,
}

impl TestStore {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let real = dir.path().join("store");
        fs::create_dir(&real).expect("create store dir");
        let config = Config {
            store_dir: PathBuf::from("/nix/store"),
            real_store_dir: Some(real),
            db_path: Some(dir.path().join("db.sqlite")),
            ..Config::default()
        };
        let db = StoreDb::create(&config.db_path()).expect("create database");
        Self { dir, config, db }
    }

    /// `foo -> bar -> baz`, `foo -> baz`, `qux -> baz`; `app` is the `out`
    /// output of `app.drv`, which references `foo` and also declares a `doc`
    /// output that was never built.
    pub fn graph() -> Self {
        let mut store = Self::new();
        store.add(BAZ, &[]);
        store.add(BAR, &[BAZ]);
        store.add(FOO, &[BAR, BAZ]);
        store.add(QUX, &[BAZ]);
        store.add(APP_DRV, &[FOO]);
        store.add_built(APP, APP_DRV, &[BAR]);
        store.add_output(APP_DRV, "out", APP);
        store.add_output(APP_DRV, "doc", DOC);
        store
    }

    pub fn real_path(&self, base: &str) -> PathBuf {
        self.config.physical_store_dir().join(base)
    }

    fn full(base: &str) -> String {
        format!("/nix/store/{base}")
    }

    /// Register `base` with an empty file as its contents.
    pub fn add(&mut self, base: &str, references: &[&str]) {
        self.add_with(base, references, None, None);
    }

    pub fn add_built(&mut self, base: &str, deriver: &str, references: &[&str]) {
        self.add_with(base, references, Some(deriver), None);
    }

    pub fn add_signed(&mut self, base: &str, references: &[&str], sigs: &[&str]) {
        self.add_with(base, references, None, Some(sigs.join(" ")));
    }

    fn add_with(
        &mut self,
        base: &str,
        references: &[&str],
        deriver: Option<&str>,
        sigs: Option<String>,
    ) {
        let real = self.real_path(base);
        if !real.exists() {
            fs::write(&real, b"").expect("write store file");
        }
        let (nar_hash, nar_size) = nar_of(&real);
        self.db
            .register_valid_path(&RegisterPathParams {
                path: Self::full(base),
                hash: nar_hash,
                nar_size: Some(nar_size),
                deriver: deriver.map(Self::full),
                sigs,
                references: references
                    .iter()
                    .map(|r| Self::full(r))
                    .collect::<BTreeSet<_>>(),
                ..Default::default()
            })
            .expect("register path");
    }

    pub fn add_output(&mut self, drv: &str, name: &str, output: &str) {
        self.db
            .register_derivation_output(&Self::full(drv), name, &Self::full(output))
            .expect("register output");
    }

    /// Register a directory tree built by `build` under the store.
    pub fn add_tree(&mut self, base: &str, build: impl FnOnce(&Path)) {
        let real = self.real_path(base);
        fs::create_dir(&real).expect("create output dir");
        build(&real);
        self.add(base, &[]);
    }

    pub fn handle(&self) -> StoreHandle {
        StoreHandle::open_with(self.config.clone()).expect("open store")
    }
}

/// `sha256:<base16>` and size of the NAR of `path`, as Nix records them.
pub fn nar_of(path: &Path) -> (String, u64) {
    let bytes = dump(path);
    let hash = Sha256::digest(&bytes);
    (format!("sha256:{}", hex::encode(hash)), bytes.len() as u64)
}

pub fn dump(path: &Path) -> Vec<u8> {
    let mut out = Vec::new();
    nar::dump(path, &mut out).expect("dump path");
    out
}
