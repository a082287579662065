// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Iterated-HMAC pseudo-random byte stream used for key expansion.
//!
//! Follows the RFC 5246 `P_hash` construction: `A(0) = seed`,
//! `A(i) = HMAC(secret, A(i-1))`, output blocks
//! `HMAC(secret, A(i) || seed)`. The channel derives per-direction
//! keys, IVs and MAC secrets by pulling consecutive bytes from one
//! stream.

use std::collections::VecDeque;

use crate::crypto::hashes::HashKind;

pub struct HmacPrf {
    kind: HashKind,
    secret: Vec<u8>,
    seed: Vec<u8>,
    a: Vec<u8>,
    pending: VecDeque<u8>,
}

impl HmacPrf {
    pub fn new(kind: HashKind, secret: &[u8], seed: &[u8]) -> Self {
        HmacPrf {
            kind,
            secret: secret.to_vec(),
            seed: seed.to_vec(),
            a: seed.to_vec(),
            pending: VecDeque::new(),
        }
    }

    /// Returns the next `n` stream bytes.
    pub fn take(&mut self, n: usize) -> Vec<u8> {
        while self.pending.len() < n {
            self.a = self.kind.hmac(&self.secret, &self.a);
            let mut block_input = self.a.clone();
            block_input.extend_from_slice(&self.seed);
            let block = self.kind.hmac(&self.secret, &block_input);
            self.pending.extend(block);
        }
        self.pending.drain(..n).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_is_deterministic_and_chunk_independent() {
        let mut a = HmacPrf::new(HashKind::Sha256, b"secret", b"seed");
        let mut b = HmacPrf::new(HashKind::Sha256, b"secret", b"seed");
        let whole = a.take(48);
        let mut parts = b.take(7);
        parts.extend(b.take(41));
        assert_eq!(whole, parts);
        assert_eq!(whole.len(), 48);
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = HmacPrf::new(HashKind::Sha1, b"secret", b"seed-1");
        let mut b = HmacPrf::new(HashKind::Sha1, b"secret", b"seed-2");
        assert_ne!(a.take(16), b.take(16));
    }
}
