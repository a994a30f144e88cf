// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Transitive closures over the reference graph.
//!
//! The closure always contains the root itself, as Nix's `computeFSClosure`
//! does, so `nix-store --query --requisites` and this module agree.

use std::collections::{BTreeSet, VecDeque};

use tracing::trace;

use crate::engine::{EngineError, EngineResult, StoreEngine};
use crate::store_path::StorePath;

/// Which edges to follow.
///
/// | flip  | include_outputs          | include_derivers         |
/// |-------|--------------------------|--------------------------|
/// | false | drv -> its valid outputs | path -> its deriver      |
/// | true  | path -> its derivers     | drv -> its valid outputs |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ClosurePolicy {
    /// Follow referrers instead of references.
    pub flip_direction: bool,
    pub include_outputs: bool,
    pub include_derivers: bool,
}

impl ClosurePolicy {
    pub fn references() -> Self {
        Self::default()
    }

    pub fn referrers() -> Self {
        Self {
            flip_direction: true,
            ..Self::default()
        }
    }
}

/// Compute the closure of `root` under `policy`.
///
/// Fails with [`EngineError::InvalidPath`] if `root` is not valid, and with
/// [`EngineError::DanglingReference`] if a path reached from it is not. Any
/// engine error during traversal aborts the whole computation.
pub fn compute_fs_closure(
    engine: &dyn StoreEngine,
    root: &StorePath,
    policy: ClosurePolicy,
) -> EngineResult<BTreeSet<StorePath>> {
    if !engine.is_valid_path(root)? {
        return Err(EngineError::InvalidPath(engine.store_dir().print_path(root)));
    }

    let mut closure = BTreeSet::from([root.clone()]);
    let mut queue = VecDeque::from([root.clone()]);

    while let Some(path) = queue.pop_front() {
        let edges = if policy.flip_direction {
            reverse_edges(engine, &path, policy)?
        } else {
            forward_edges(engine, &path, policy)?
        };
        for next in edges {
            if closure.insert(next.clone()) {
                trace!("closure of {root}: {path} -> {next}");
                queue.push_back(next);
            }
        }
    }

    Ok(closure)
}

fn forward_edges(
    engine: &dyn StoreEngine,
    path: &StorePath,
    policy: ClosurePolicy,
) -> EngineResult<Vec<StorePath>> {
    let info = engine
        .query_path_info(path)?
        .ok_or_else(|| EngineError::DanglingReference(engine.store_dir().print_path(path)))?;

    let mut edges: Vec<_> = info.references.into_iter().filter(|r| r != path).collect();

    if policy.include_outputs && path.is_derivation() {
        edges.extend(valid_outputs(engine, path)?);
    }
    if policy.include_derivers
        && let Some(deriver) = info.deriver
        && engine.is_valid_path(&deriver)?
    {
        edges.push(deriver);
    }
    Ok(edges)
}

fn reverse_edges(
    engine: &dyn StoreEngine,
    path: &StorePath,
    policy: ClosurePolicy,
) -> EngineResult<Vec<StorePath>> {
    let mut edges: Vec<_> = engine
        .query_referrers(path)?
        .into_iter()
        .filter(|r| r != path)
        .collect();

    if policy.include_outputs {
        edges.extend(engine.query_valid_derivers(path)?);
    }
    if policy.include_derivers && path.is_derivation() {
        edges.extend(valid_outputs(engine, path)?);
    }
    Ok(edges)
}

fn valid_outputs(engine: &dyn StoreEngine, drv: &StorePath) -> EngineResult<Vec<StorePath>> {
    let mut outputs = Vec::new();
    for output in engine.query_derivation_outputs(drv)? {
        if engine.is_valid_path(&output)? {
            outputs.push(output);
        }
    }
    Ok(outputs)
}
