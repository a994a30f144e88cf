// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Store path base names and the store directory they live in.
//!
//! On the wire a store path is the bare base name as ASCII bytes, e.g.
//! `9bwryidal9q3g91cjm6xschfn4ikd82q-hello-2.12.1`, without the store
//! directory. [`StorePath::from_bytes`] is the only way to build one, so every
//! value of the type is a syntactically valid store path.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::base32;

/// Length of the nix-base32 hash part (160 bits).
pub const HASH_PART_LEN: usize = base32::encode_len(20);

/// Longest name Nix accepts after the hash part.
pub const MAX_NAME_LEN: usize = 211;

const DRV_EXTENSION: &str = ".drv";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseStorePathError {
    #[error("store path is {0} bytes long, expected at least {min}", min = HASH_PART_LEN + 2)]
    TooShort(usize),
    #[error("invalid character {1:?} at position {0} of the hash part")]
    HashSymbol(usize, char),
    #[error("expected '-' after the hash part, found {0:?}")]
    MissingSeparator(char),
    #[error("store path name is {0} bytes long, at most {MAX_NAME_LEN} are allowed")]
    NameTooLong(usize),
    #[error("invalid symbol {1:?} at position {0} of the store path name")]
    NameSymbol(usize, char),
    #[error("store path name '{0}' is not allowed")]
    ReservedName(String),
    #[error("path '{path}' is not in the store directory '{store_dir}'")]
    NotInStore { path: String, store_dir: String },
    #[error("hash part is {0} bytes long, expected {HASH_PART_LEN}")]
    HashPartLength(usize),
    #[error("store directory '{0}' is not an absolute path")]
    RelativeStoreDir(String),
}

/// A validated store path base name (`<hash>-<name>`).
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorePath(String);

impl StorePath {
    /// Decode the wire form. Rejects anything that is not exactly one valid
    /// store path component; nothing is trimmed or truncated.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseStorePathError> {
        if bytes.len() < HASH_PART_LEN + 2 {
            return Err(ParseStorePathError::TooShort(bytes.len()));
        }
        validate_hash_part(&bytes[..HASH_PART_LEN])?;
        let separator = bytes[HASH_PART_LEN];
        if separator != b'-' {
            return Err(ParseStorePathError::MissingSeparator(char::from(separator)));
        }
        let name = &bytes[HASH_PART_LEN + 1..];
        validate_name(name, HASH_PART_LEN + 1)?;

        // Every byte was checked to be ASCII above.
        let s = bytes.iter().copied().map(char::from).collect();
        Ok(Self(s))
    }

    /// Encode to the wire form.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn hash_part(&self) -> &str {
        &self.0[..HASH_PART_LEN]
    }

    pub fn name(&self) -> &str {
        &self.0[HASH_PART_LEN + 1..]
    }

    /// Whether this is a store derivation (`.drv`).
    pub fn is_derivation(&self) -> bool {
        self.name().ends_with(DRV_EXTENSION)
    }
}

impl AsRef<str> for StorePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for StorePath {
    type Err = ParseStorePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(s.as_bytes())
    }
}

impl TryFrom<&[u8]> for StorePath {
    type Error = ParseStorePathError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Self::from_bytes(bytes)
    }
}

impl TryFrom<String> for StorePath {
    type Error = ParseStorePathError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_bytes(s.as_bytes())
    }
}

impl From<StorePath> for String {
    fn from(path: StorePath) -> Self {
        path.0
    }
}

/// Check a bare hash part, as used by `query_path_from_hash_part`.
pub fn validate_hash_part(hash: &[u8]) -> Result<(), ParseStorePathError> {
    if hash.len() != HASH_PART_LEN {
        return Err(ParseStorePathError::HashPartLength(hash.len()));
    }
    match hash.iter().position(|&c| !base32::is_valid_char(c)) {
        Some(pos) => Err(ParseStorePathError::HashSymbol(pos, char::from(hash[pos]))),
        None => Ok(()),
    }
}

fn validate_name(name: &[u8], offset: usize) -> Result<(), ParseStorePathError> {
    if name.len() > MAX_NAME_LEN {
        return Err(ParseStorePathError::NameTooLong(name.len()));
    }
    if let Some(pos) = name.iter().position(|&c| !is_name_char(c)) {
        return Err(ParseStorePathError::NameSymbol(
            offset + pos,
            char::from(name[pos]),
        ));
    }
    if name == b"." || name == b".." || name.starts_with(b".-") || name.starts_with(b"..-") {
        return Err(ParseStorePathError::ReservedName(
            String::from_utf8_lossy(name).into_owned(),
        ));
    }
    Ok(())
}

fn is_name_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'+' | b'-' | b'.' | b'_' | b'?' | b'=')
}

/// The logical store directory, `/nix/store` unless configured otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreDir(String);

impl StoreDir {
    /// `dir` must be absolute; a trailing slash is dropped.
    pub fn new(dir: impl Into<String>) -> Result<Self, ParseStorePathError> {
        let mut dir = dir.into();
        while dir.len() > 1 && dir.ends_with('/') {
            dir.pop();
        }
        if !dir.starts_with('/') || dir.len() < 2 {
            return Err(ParseStorePathError::RelativeStoreDir(dir));
        }
        Ok(Self(dir))
    }

    pub fn to_str(&self) -> &str {
        &self.0
    }

    /// Full path as recorded in the store database.
    pub fn print_path(&self, path: &StorePath) -> String {
        format!("{}/{}", self.0, path)
    }

    pub fn to_path(&self, path: &StorePath) -> PathBuf {
        PathBuf::from(self.print_path(path))
    }

    /// Parse a full path (`/nix/store/<hash>-<name>`) back into its base name.
    pub fn parse_path(&self, full: &str) -> Result<StorePath, ParseStorePathError> {
        let base = full
            .strip_prefix(self.0.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| ParseStorePathError::NotInStore {
                path: full.to_string(),
                store_dir: self.0.clone(),
            })?;
        StorePath::from_bytes(base.as_bytes())
    }
}

impl Default for StoreDir {
    fn default() -> Self {
        Self("/nix/store".into())
    }
}

impl fmt::Display for StoreDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
