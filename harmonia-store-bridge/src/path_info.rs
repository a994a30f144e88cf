// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

use std::time::SystemTime;

use tracing::trace;

use crate::engine::PathInfo;
use crate::store_path::StorePath;

/// Read-only view of a path info record returned by
/// [`StoreHandle::query_path_info`](crate::StoreHandle::query_path_info).
///
/// The record is a snapshot taken when the query ran; later changes to the
/// store are not reflected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMetadata {
    info: PathInfo,
}

impl PathMetadata {
    pub(crate) fn new(info: PathInfo) -> Self {
        Self { info }
    }

    pub fn path(&self) -> &StorePath {
        &self.info.path
    }

    /// Signatures in the order the store recorded them. Empty for unsigned paths.
    pub fn signatures(&self) -> Vec<String> {
        self.info.signatures.clone()
    }

    /// Base names of the directly referenced paths, in store order.
    pub fn references(&self) -> Vec<String> {
        self.info
            .references
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    pub fn deriver(&self) -> Option<&StorePath> {
        self.info.deriver.as_ref()
    }

    pub fn nar_hash(&self) -> &str {
        &self.info.nar_hash
    }

    pub fn nar_size(&self) -> Option<u64> {
        self.info.nar_size
    }

    pub fn registration_time(&self) -> SystemTime {
        self.info.registration_time
    }

    pub fn ultimate(&self) -> bool {
        self.info.ultimate
    }

    pub fn ca(&self) -> Option<&str> {
        self.info.ca.as_deref()
    }

    /// Key names of the signatures (the part before `:`).
    pub fn signees(&self) -> Vec<&str> {
        let signees: Vec<_> = self
            .info
            .signatures
            .iter()
            .filter_map(|sig| Some(sig.split_once(':')?.0))
            .collect();
        trace!("signees for {}: {:?}", self.info.path, signees);
        signees
    }

    /// Whether any signature was made by one of `caches`.
    ///
    /// Key names usually carry a generation suffix (`cache.nixos.org-1`),
    /// which is ignored, so `cache.nixos.org` matches it.
    pub fn is_signed_by<S: AsRef<str>>(&self, caches: &[S]) -> bool {
        self.signees().into_iter().any(|signee| {
            let signee = strip_key_generation(signee);
            caches.iter().any(|cache| cache.as_ref() == signee)
        })
    }
}

fn strip_key_generation(name: &str) -> &str {
    match name.rsplit_once('-') {
        Some((base, generation))
            if !generation.is_empty() && generation.bytes().all(|b| b.is_ascii_digit()) =>
        {
            base
        }
        _ => name,
    }
}
