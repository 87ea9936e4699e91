// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Filesystem-safe session key derivation.

use sha2::{Digest, Sha256};

/// Map every character outside `[A-Za-z0-9_-]` to `_`.
///
/// Lossy on its own ("a:b" and "a_b" collide); [`collision_suffix`] is
/// appended by the store when a mapped name is already claimed by a
/// different original key.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Short content-hash suffix disambiguating colliding keys.
pub fn collision_suffix(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let hex: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    hex
}
