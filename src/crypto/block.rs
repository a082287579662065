// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Symmetric block ciphers and sequential block transforms.
//!
//! A [`BlockTransform`] holds a key, an initialization vector, a mode
//! (CBC or OFB) and a direction, and is consumed sequentially: each
//! `transform` call continues the chaining state of the previous one.
//! Input must be whole blocks.

use core::fmt;
use std::str::FromStr;

use aes::{
    Aes128, Aes256,
    cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray},
};
use serde::{Deserialize, Serialize};

use crate::{
    crypto::prf::HmacPrf,
    error::{Error, Result},
};

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherAlgo {
    #[serde(rename = "aes128", alias = "AES128")]
    Aes128,
    #[serde(rename = "aes256", alias = "AES256")]
    Aes256,
}

impl CipherAlgo {
    pub fn key_len(self) -> usize {
        match self {
            CipherAlgo::Aes128 => 16,
            CipherAlgo::Aes256 => 32,
        }
    }

    pub fn block_len(self) -> usize {
        16
    }

    /// Draws a key of the right length from a PRF stream.
    pub fn generate_key(self, prf: &mut HmacPrf) -> Vec<u8> {
        prf.take(self.key_len())
    }

    pub fn encrypter(
        self,
        key: &[u8],
        iv: &[u8],
        mode: CipherMode,
    ) -> Result<BlockTransform> {
        BlockTransform::new(self, key, iv, mode, true)
    }

    pub fn decrypter(
        self,
        key: &[u8],
        iv: &[u8],
        mode: CipherMode,
    ) -> Result<BlockTransform> {
        BlockTransform::new(self, key, iv, mode, false)
    }
}

impl fmt::Display for CipherAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CipherAlgo::Aes128 => "aes128",
            CipherAlgo::Aes256 => "aes256",
        })
    }
}

impl FromStr for CipherAlgo {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "aes128" => Ok(CipherAlgo::Aes128),
            "aes256" => Ok(CipherAlgo::Aes256),
            _ => Err(()),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherMode {
    #[serde(rename = "cbc", alias = "CBC")]
    Cbc,
    #[serde(rename = "ofb", alias = "OFB")]
    Ofb,
}

impl fmt::Display for CipherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CipherMode::Cbc => "cbc",
            CipherMode::Ofb => "ofb",
        })
    }
}

impl FromStr for CipherMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "cbc" => Ok(CipherMode::Cbc),
            "ofb" => Ok(CipherMode::Ofb),
            _ => Err(()),
        }
    }
}

/// Sequential whole-block transform. Input and output block sizes may
/// differ for asymmetric wrappers, see
/// [`RsaBlockTransform`](crate::crypto::rsa::RsaBlockTransform).
pub trait BlockTransformer {
    fn in_blocksize(&self) -> usize;
    fn out_blocksize(&self) -> usize;
    fn transform(&mut self, data: &[u8]) -> Result<Vec<u8>>;
}

enum AesCore {
    Aes128(Box<Aes128>),
    Aes256(Box<Aes256>),
}

impl AesCore {
    fn encrypt_block(&self, block: &mut [u8; 16]) {
        let ga = GenericArray::from_mut_slice(block);
        match self {
            AesCore::Aes128(c) => c.encrypt_block(ga),
            AesCore::Aes256(c) => c.encrypt_block(ga),
        }
    }

    fn decrypt_block(&self, block: &mut [u8; 16]) {
        let ga = GenericArray::from_mut_slice(block);
        match self {
            AesCore::Aes128(c) => c.decrypt_block(ga),
            AesCore::Aes256(c) => c.decrypt_block(ga),
        }
    }
}

pub struct BlockTransform {
    core: AesCore,
    mode: CipherMode,
    encrypt: bool,
    /// CBC chaining value or OFB feedback register.
    state: [u8; 16],
}

impl BlockTransform {
    pub fn new(
        algo: CipherAlgo,
        key: &[u8],
        iv: &[u8],
        mode: CipherMode,
        encrypt: bool,
    ) -> Result<Self> {
        if key.len() != algo.key_len() {
            return Err(Error::crypto(format!(
                "{algo} key must be {} bytes, got {}",
                algo.key_len(),
                key.len()
            )));
        }
        if iv.len() != algo.block_len() {
            return Err(Error::crypto(format!(
                "{algo} iv must be {} bytes, got {}",
                algo.block_len(),
                iv.len()
            )));
        }
        let core = match algo {
            CipherAlgo::Aes128 => AesCore::Aes128(Box::new(Aes128::new(
                GenericArray::from_slice(key),
            ))),
            CipherAlgo::Aes256 => AesCore::Aes256(Box::new(Aes256::new(
                GenericArray::from_slice(key),
            ))),
        };
        let mut state = [0u8; 16];
        state.copy_from_slice(iv);
        Ok(BlockTransform {
            core,
            mode,
            encrypt,
            state,
        })
    }

    fn transform_block(&mut self, input: &[u8], out: &mut Vec<u8>) {
        let mut block = [0u8; 16];
        block.copy_from_slice(input);
        match (self.mode, self.encrypt) {
            (CipherMode::Cbc, true) => {
                for (b, s) in block.iter_mut().zip(self.state.iter()) {
                    *b ^= s;
                }
                self.core.encrypt_block(&mut block);
                self.state = block;
                out.extend_from_slice(&block);
            },
            (CipherMode::Cbc, false) => {
                let cipher_in = block;
                self.core.decrypt_block(&mut block);
                for (b, s) in block.iter_mut().zip(self.state.iter()) {
                    *b ^= s;
                }
                self.state = cipher_in;
                out.extend_from_slice(&block);
            },
            (CipherMode::Ofb, _) => {
                // OFB keystream is direction independent.
                self.core.encrypt_block(&mut self.state);
                for (b, s) in block.iter_mut().zip(self.state.iter()) {
                    *b ^= s;
                }
                out.extend_from_slice(&block);
            },
        }
    }
}

impl BlockTransformer for BlockTransform {
    fn in_blocksize(&self) -> usize {
        16
    }

    fn out_blocksize(&self) -> usize {
        16
    }

    fn transform(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() || data.len() % 16 != 0 {
            return Err(Error::crypto(format!(
                "input length {} is not a whole number of blocks",
                data.len()
            )));
        }
        let mut out = Vec::with_capacity(data.len());
        for chunk in data.chunks_exact(16) {
            self.transform_block(chunk, &mut out);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(algo: CipherAlgo, mode: CipherMode) {
        let key = vec![0x42; algo.key_len()];
        let iv = [0x17; 16];
        let plain = b"0123456789abcdef0123456789abcdefAAAAAAAAAAAAAAAA";
        let mut enc = algo.encrypter(&key, &iv, mode).expect("encrypter");
        let mut dec = algo.decrypter(&key, &iv, mode).expect("decrypter");
        let cipher = enc.transform(plain).expect("encrypt");
        assert_ne!(cipher, plain.to_vec());
        assert_eq!(dec.transform(&cipher).expect("decrypt"), plain.to_vec());
    }

    #[test]
    fn cbc_and_ofb_roundtrip() {
        for algo in [CipherAlgo::Aes128, CipherAlgo::Aes256] {
            for mode in [CipherMode::Cbc, CipherMode::Ofb] {
                roundtrip(algo, mode);
            }
        }
    }

    #[test]
    fn transform_is_sequential() {
        let key = vec![7u8; 32];
        let iv = [9u8; 16];
        let plain = vec![0x5a; 64];
        let mut one = CipherAlgo::Aes256
            .encrypter(&key, &iv, CipherMode::Cbc)
            .expect("encrypter");
        let whole = one.transform(&plain).expect("encrypt");

        let mut two = CipherAlgo::Aes256
            .encrypter(&key, &iv, CipherMode::Cbc)
            .expect("encrypter");
        let mut split = two.transform(&plain[..16]).expect("encrypt");
        split.extend(two.transform(&plain[16..]).expect("encrypt"));
        assert_eq!(whole, split);
    }

    #[test]
    fn rejects_partial_blocks() {
        let key = vec![1u8; 16];
        let iv = [0u8; 16];
        let mut enc = CipherAlgo::Aes128
            .encrypter(&key, &iv, CipherMode::Cbc)
            .expect("encrypter");
        assert!(enc.transform(&[0u8; 15]).is_err());
    }
}
