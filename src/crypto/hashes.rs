// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Hash algorithms available to the channel and the X.509 layer.
//!
//! The provider set is a closed enum; channel negotiation works on the
//! wire names and only ever selects out of this set.

use core::fmt;
use std::str::FromStr;

use enum_dispatch::enum_dispatch;
use hmac::{Hmac, Mac};
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::asn1::Oid;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashKind {
    #[serde(rename = "sha1", alias = "SHA1", alias = "sha-1")]
    Sha1,
    #[serde(rename = "sha256", alias = "SHA256", alias = "sha-256")]
    Sha256,
    #[serde(rename = "md5", alias = "MD5")]
    Md5,
}

impl HashKind {
    pub fn digest_size(self) -> usize {
        match self {
            HashKind::Sha1 => 20,
            HashKind::Sha256 => 32,
            HashKind::Md5 => 16,
        }
    }

    /// DigestAlgorithm object identifier, as used inside DigestInfo.
    pub fn oid(self) -> Oid {
        match self {
            HashKind::Sha1 => Oid::new(&[1, 3, 14, 3, 2, 26]),
            HashKind::Sha256 => Oid::new(&[2, 16, 840, 1, 101, 3, 4, 2, 1]),
            HashKind::Md5 => Oid::new(&[1, 2, 840, 113549, 2, 5]),
        }
    }

    pub fn hasher(self) -> Hasher {
        match self {
            HashKind::Sha1 => Hasher::from(Sha1::new()),
            HashKind::Sha256 => Hasher::from(Sha256::new()),
            HashKind::Md5 => Hasher::from(Md5::new()),
        }
    }

    /// One-shot digest.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finish()
    }

    /// RFC 2104 HMAC keyed with `key`.
    pub fn hmac(self, key: &[u8], msg: &[u8]) -> Vec<u8> {
        match self {
            HashKind::Sha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(key)
                    .expect("HMAC accepts any key length");
                mac.update(msg);
                mac.finalize().into_bytes().to_vec()
            },
            HashKind::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key)
                    .expect("HMAC accepts any key length");
                mac.update(msg);
                mac.finalize().into_bytes().to_vec()
            },
            HashKind::Md5 => {
                let mut mac = Hmac::<Md5>::new_from_slice(key)
                    .expect("HMAC accepts any key length");
                mac.update(msg);
                mac.finalize().into_bytes().to_vec()
            },
        }
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HashKind::Sha1 => "sha1",
            HashKind::Sha256 => "sha256",
            HashKind::Md5 => "md5",
        })
    }
}

impl FromStr for HashKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "sha1" => Ok(HashKind::Sha1),
            "sha256" => Ok(HashKind::Sha256),
            "md5" => Ok(HashKind::Md5),
            _ => Err(()),
        }
    }
}

/// Incremental digest over the closed provider set.
#[enum_dispatch]
pub trait MessageDigest {
    fn update(&mut self, data: &[u8]);
    fn finish(self) -> Vec<u8>;
}

#[enum_dispatch(MessageDigest)]
pub enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
    Md5(Md5),
}

impl MessageDigest for Sha1 {
    fn update(&mut self, data: &[u8]) {
        Digest::update(self, data);
    }

    fn finish(self) -> Vec<u8> {
        self.finalize().to_vec()
    }
}

impl MessageDigest for Sha256 {
    fn update(&mut self, data: &[u8]) {
        Digest::update(self, data);
    }

    fn finish(self) -> Vec<u8> {
        self.finalize().to_vec()
    }
}

impl MessageDigest for Md5 {
    fn update(&mut self, data: &[u8]) {
        Digest::update(self, data);
    }

    fn finish(self) -> Vec<u8> {
        self.finalize().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    #[test]
    fn sha1_empty_vector() {
        assert_eq!(
            HashKind::Sha1.digest(b""),
            hex!("da39a3ee5e6b4b0d3255bfef95601890afd80709").to_vec()
        );
    }

    #[test]
    fn hmac_sha256_rfc4231_case1() {
        let key = [0x0b; 20];
        let out = HashKind::Sha256.hmac(&key, b"Hi There");
        assert_eq!(
            out,
            hex!(
                "b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff7"
            )
            .to_vec()
        );
    }
}
