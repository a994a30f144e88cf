// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Nix base32: the alphabet used by store path hash parts and hash rendering.

use std::sync::LazyLock;

use data_encoding::{BitOrder, Encoding, Specification};

/// Omits `e`, `o`, `u` and `t`.
pub(crate) const ALPHABET: &str = "0123456789abcdfghijklmnpqrsvwxyz";

static NIX_BASE32: LazyLock<Encoding> = LazyLock::new(|| {
    let mut spec = Specification::new();
    spec.symbols.push_str(ALPHABET);
    spec.bit_order = BitOrder::LeastSignificantFirst;
    spec.encoding()
        .expect("nix base32 alphabet is a valid 32 symbol specification")
});

pub(crate) fn is_valid_char(c: u8) -> bool {
    ALPHABET.as_bytes().contains(&c)
}

pub(crate) const fn encode_len(len: usize) -> usize {
    (8 * len).div_ceil(5)
}

/// Encode bytes the way Nix prints hashes (LSB first, then reversed).
pub(crate) fn encode_string(input: &[u8]) -> String {
    NIX_BASE32.encode(input).chars().rev().collect()
}
