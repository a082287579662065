// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt::Write;

use rand::RngExt;
use sha1::{Digest, Sha1};

/// Fills a fresh buffer of `n` bytes from the thread CSPRNG.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::rng().fill(buf.as_mut_slice());
    buf
}

/// Short hex fingerprint (SHA-1 prefix) used when logging key and
/// certificate material.
pub fn fingerprint(data: &[u8]) -> String {
    let digest = Sha1::digest(data);
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        write!(&mut hex, "{byte:02x}").expect("Writing to String cannot fail");
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable() {
        let fp = fingerprint(b"fingerprint me");
        assert_eq!(fp.len(), 16);
        assert_eq!(fp, fingerprint(b"fingerprint me"));
        let decoded = hex::decode(&fp).expect("failed decode");
        assert_eq!(decoded.len(), 8);
    }

    #[test]
    fn test_random_bytes_len() {
        assert_eq!(random_bytes(32).len(), 32);
        assert_ne!(random_bytes(32), random_bytes(32));
    }
}
