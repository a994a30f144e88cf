// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Async access to a Nix store.
//!
//! This crate exposes a store engine (the thing that owns `db.sqlite` and the
//! store directory) to async callers: path info queries, transitive closures
//! over the reference graph and NAR streaming.
//!
//! **Architecture**: This is the Adapter Layer. The engine itself is
//! synchronous and blocking; every call into it runs on Tokio's blocking pool
//! and its results cross back over a channel.
//!
//! # Key Features
//!
//! - Store path parsing and validation at the boundary ([`StorePath`])
//! - Path info views with signatures and references ([`PathMetadata`])
//! - Forward and reverse closures with output/deriver expansion
//! - NAR streaming with back-pressure and a single terminal signal ([`NarStream`])
//!
//! # Example
//!
//! ```ignore
//! use harmonia_store_bridge::StoreHandle;
//!
//! let store = StoreHandle::open()?;
//! let info = store.query_path_info(b"9bwryidal9q3g91cjm6xschfn4ikd82q-hello-2.12.1").await?;
//! for sig in info.signatures() {
//!     println!("{sig}");
//! }
//! let closure = store
//!     .compute_fs_closure(b"9bwryidal9q3g91cjm6xschfn4ikd82q-hello-2.12.1", false, false, false)
//!     .await?;
//! ```

mod base32;
pub mod closure;
pub mod config;
pub mod engine;
mod error;
mod handle;
pub mod local;
pub mod nar;
mod path_info;
pub mod store_path;
mod stream;

pub use closure::ClosurePolicy;
pub use config::Config;
pub use engine::{EngineError, EngineResult, PathInfo, StoreBackend, StoreEngine};
pub use error::{ConfigError, Error, Result};
pub use handle::StoreHandle;
pub use path_info::PathMetadata;
pub use store_path::{ParseStorePathError, StoreDir, StorePath};
pub use stream::{NarDigest, NarStream};
