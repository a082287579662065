// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Framed message cipher with integrity validation.
//!
//! Plaintext is wrapped as `len_hi len_lo || plaintext || padding ||
//! HMAC(secret, counter || frame-without-mac)` and block encrypted. The
//! two length bytes carry `plaintext_len - 1`, padding fills the frame
//! to the plaintext block size without ever adding a full pad block,
//! and the monotonically increasing per-direction counter participates
//! in the MAC but is never transmitted.

use num_bigint_dig::BigUint;
use rand::RngExt;
use serde::{Deserialize, Serialize};

use crate::{
    codec::netint,
    crypto::{block::BlockTransformer, hashes::HashKind},
    error::{Error, Result},
    io::buf::ByteBuf,
};

/// Hard limit implied by the 2-byte length header.
pub const MAX_PLAINTEXT_LEN: usize = 0x10000;

/// Source of frame padding bytes.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PadGenerator {
    #[default]
    Zero,
    Random,
}

impl PadGenerator {
    pub fn padding(self, n: usize) -> Vec<u8> {
        match self {
            PadGenerator::Zero => vec![0u8; n],
            PadGenerator::Random => {
                let mut buf = vec![0u8; n];
                rand::rng().fill(buf.as_mut_slice());
                buf
            },
        }
    }
}

fn counter_bytes(num: u64) -> Vec<u8> {
    netint::posint_to_bytes(&BigUint::from(num))
}

fn pad_len(msg_len: usize, blocksize: usize) -> usize {
    let rem = msg_len % blocksize;
    if rem != 0 { blocksize - rem } else { 0 }
}

pub struct MessageEncrypter {
    transform: Box<dyn BlockTransformer>,
    hash: HashKind,
    mac_secret: Vec<u8>,
    padder: PadGenerator,
    msg_num: u64,
}

impl MessageEncrypter {
    pub fn new(
        transform: Box<dyn BlockTransformer>,
        hash: HashKind,
        mac_secret: Vec<u8>,
        padder: PadGenerator,
    ) -> Self {
        MessageEncrypter {
            transform,
            hash,
            mac_secret,
            padder,
            msg_num: 0,
        }
    }

    /// Frames and encrypts one plaintext message.
    pub fn message(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.is_empty() {
            return Err(Error::crypto("empty plaintext not allowed"));
        }
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(Error::crypto("plaintext too long"));
        }

        let bsize = self.transform.in_blocksize();
        let msg_len = 2 + plaintext.len() + self.hash.digest_size();
        let padding = self.padder.padding(pad_len(msg_len, bsize));

        let encode_len = plaintext.len() - 1;
        let len_bytes = [(encode_len >> 8) as u8, (encode_len & 0xff) as u8];

        let mut mac_msg = counter_bytes(self.msg_num);
        mac_msg.extend_from_slice(&len_bytes);
        mac_msg.extend_from_slice(plaintext);
        mac_msg.extend_from_slice(&padding);
        let mac = self.hash.hmac(&self.mac_secret, &mac_msg);

        let mut frame = Vec::with_capacity(msg_len + padding.len());
        frame.extend_from_slice(&len_bytes);
        frame.extend_from_slice(plaintext);
        frame.extend_from_slice(&padding);
        frame.extend_from_slice(&mac);

        let out = self.transform.transform(&frame)?;
        self.msg_num += 1;
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    NeedLen,
    NeedBody,
    Done,
    Error,
}

pub struct MessageDecrypter {
    transform: Box<dyn BlockTransformer>,
    hash: HashKind,
    mac_secret: Vec<u8>,
    state: DecodeState,
    /// Undecrypted input, always shorter than one cipher block between
    /// calls.
    in_buf: Vec<u8>,
    /// Decrypted frame bytes accumulated so far.
    msg_buf: Vec<u8>,
    plaintext_len: usize,
    result: Option<Vec<u8>>,
    msg_num: u64,
    seen_data: bool,
}

impl MessageDecrypter {
    pub fn new(
        transform: Box<dyn BlockTransformer>,
        hash: HashKind,
        mac_secret: Vec<u8>,
    ) -> Self {
        MessageDecrypter {
            transform,
            hash,
            mac_secret,
            state: DecodeState::NeedLen,
            in_buf: Vec::new(),
            msg_buf: Vec::new(),
            plaintext_len: 0,
            result: None,
            msg_num: 0,
            seen_data: false,
        }
    }

    /// Reads ciphertext until one frame decodes; returns bytes consumed.
    ///
    /// Bytes belonging to subsequent frames are left in `buf`.
    pub fn read(&mut self, buf: &ByteBuf) -> Result<usize> {
        let cb = self.transform.in_blocksize();
        let pb = self.transform.out_blocksize();
        let mut num_read = 0usize;

        while !buf.is_empty()
            && self.result.is_none()
            && self.state != DecodeState::Error
        {
            if self.state == DecodeState::NeedLen {
                let need = cb - self.in_buf.len();
                let data = buf.pop(need);
                num_read += data.len();
                self.in_buf.extend_from_slice(&data);
                self.seen_data |= num_read > 0;
                if self.in_buf.len() < cb {
                    break;
                }
                let block = self.decrypt_pending()?;
                self.msg_buf.extend_from_slice(&block);
                self.plaintext_len =
                    1 + (((self.msg_buf[0] as usize) << 8) + self.msg_buf[1] as usize);
                self.state = DecodeState::NeedBody;
            }

            let msg_len = {
                let base = 2 + self.plaintext_len + self.hash.digest_size();
                base + pad_len(base, pb)
            };

            if self.state == DecodeState::NeedBody && self.msg_buf.len() < msg_len {
                let msg_left = msg_len - self.msg_buf.len();
                let blocks_left = msg_left / pb;
                let input_left = blocks_left * cb - self.in_buf.len();
                let data = buf.pop(input_left);
                num_read += data.len();
                self.in_buf.extend_from_slice(&data);

                let num_decode = self.in_buf.len() - self.in_buf.len() % cb;
                if num_decode > 0 {
                    let chunk: Vec<u8> = self.in_buf.drain(..num_decode).collect();
                    let plain = self.transform.transform(&chunk)?;
                    self.msg_buf.extend_from_slice(&plain);
                } else if self.msg_buf.len() != msg_len {
                    break;
                }
            }

            if self.state == DecodeState::NeedBody && self.msg_buf.len() >= msg_len {
                self.finish_frame(msg_len);
            }
        }

        if self.state == DecodeState::Error {
            return Err(Error::crypto("message failed to verify"));
        }
        Ok(num_read)
    }

    fn decrypt_pending(&mut self) -> Result<Vec<u8>> {
        let chunk: Vec<u8> = std::mem::take(&mut self.in_buf);
        self.transform.transform(&chunk)
    }

    fn finish_frame(&mut self, msg_len: usize) {
        let hash_len = self.hash.digest_size();
        let frame = &self.msg_buf[..msg_len];
        let (sans_mac, mac) = frame.split_at(msg_len - hash_len);

        let mut mac_msg = counter_bytes(self.msg_num);
        mac_msg.extend_from_slice(sans_mac);
        if self.hash.hmac(&self.mac_secret, &mac_msg) == mac {
            self.result = Some(sans_mac[2..2 + self.plaintext_len].to_vec());
            self.msg_num += 1;
            self.state = DecodeState::Done;
        } else {
            self.state = DecodeState::Error;
        }
    }

    /// True once a frame fully decoded. A MAC mismatch is fatal and
    /// surfaces here.
    pub fn done(&self) -> Result<bool> {
        if self.state == DecodeState::Error {
            return Err(Error::crypto("message failed to verify"));
        }
        Ok(self.result.is_some())
    }

    pub fn result(&self) -> Result<&[u8]> {
        if self.state == DecodeState::Error {
            return Err(Error::crypto("message failed to verify"));
        }
        self.result
            .as_deref()
            .ok_or_else(|| Error::crypto("message not yet fully decoded"))
    }

    /// Prepares the decrypter for the next frame.
    pub fn reset(&mut self) -> Result<()> {
        if self.result.is_none() {
            return Err(Error::crypto("ongoing decryption not completed"));
        }
        self.msg_buf.clear();
        self.plaintext_len = 0;
        self.result = None;
        self.state = DecodeState::NeedLen;
        self.seen_data = !self.in_buf.is_empty();
        Ok(())
    }

    /// True if any bytes were read since creation or the last reset.
    pub fn has_data(&self) -> bool {
        self.seen_data
            || !self.in_buf.is_empty()
            || !self.msg_buf.is_empty()
            || self.result.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{
        block::{CipherAlgo, CipherMode},
        prf::HmacPrf,
    };

    fn pair(mac_secret: &[u8]) -> (MessageEncrypter, MessageDecrypter) {
        let mut prf = HmacPrf::new(HashKind::Sha256, b"", b"frame test seed");
        let key = CipherAlgo::Aes256.generate_key(&mut prf);
        let iv = prf.take(16);
        let enc = CipherAlgo::Aes256
            .encrypter(&key, &iv, CipherMode::Cbc)
            .expect("encrypter");
        let dec = CipherAlgo::Aes256
            .decrypter(&key, &iv, CipherMode::Cbc)
            .expect("decrypter");
        (
            MessageEncrypter::new(
                Box::new(enc),
                HashKind::Sha1,
                mac_secret.to_vec(),
                PadGenerator::Zero,
            ),
            MessageDecrypter::new(Box::new(dec), HashKind::Sha1, mac_secret.to_vec()),
        )
    }

    #[test]
    fn frame_roundtrip_multiple_messages() {
        let (mut enc, mut dec) = pair(b"mac secret");
        let messages: [&[u8]; 3] = [b"hello", &[0x7fu8; 4096], b"x"];
        for msg in messages {
            let wire = enc.message(msg).expect("encrypt");
            let buf = ByteBuf::from_slice(&wire);
            dec.read(&buf).expect("read");
            assert!(dec.done().expect("done"));
            assert_eq!(dec.result().expect("result"), msg);
            dec.reset().expect("reset");
        }
    }

    #[test]
    fn frame_decodes_across_partial_reads() {
        let (mut enc, mut dec) = pair(b"mac secret");
        let wire = enc.message(b"split into tiny pieces").expect("encrypt");
        for chunk in wire.chunks(3) {
            let buf = ByteBuf::from_slice(chunk);
            dec.read(&buf).expect("read");
            assert!(buf.is_empty());
        }
        assert!(dec.done().expect("done"));
        assert_eq!(dec.result().expect("result"), b"split into tiny pieces");
    }

    #[test]
    fn bit_flip_fails_mac() {
        let (mut enc, mut dec) = pair(b"mac secret");
        let mut wire = enc.message(b"tamper with me").expect("encrypt");
        wire[5] ^= 0x01;
        let buf = ByteBuf::from_slice(&wire);
        let _ = dec.read(&buf);
        assert!(dec.done().is_err());
    }

    #[test]
    fn replayed_frame_fails_mac() {
        let (mut enc, mut dec) = pair(b"mac secret");
        let first = enc.message(b"frame one").expect("encrypt");
        let buf = ByteBuf::from_slice(&first);
        dec.read(&buf).expect("read");
        assert!(dec.done().expect("done"));
        dec.reset().expect("reset");

        // Same ciphertext again: the implicit counter has moved on.
        let buf = ByteBuf::from_slice(&first);
        let _ = dec.read(&buf);
        assert!(dec.done().is_err());
    }

    #[test]
    fn aligned_frame_gets_no_padding() {
        // 2 + 30 + 32 = 64 bytes, already a block multiple.
        let mut prf = HmacPrf::new(HashKind::Sha256, b"", b"pad probe");
        let key = CipherAlgo::Aes256.generate_key(&mut prf);
        let iv = prf.take(16);
        let enc_t = CipherAlgo::Aes256
            .encrypter(&key, &iv, CipherMode::Cbc)
            .expect("encrypter");
        let mut enc = MessageEncrypter::new(
            Box::new(enc_t),
            HashKind::Sha256,
            b"s".to_vec(),
            PadGenerator::Zero,
        );
        let wire = enc.message(&[0x11u8; 30]).expect("encrypt");
        assert_eq!(wire.len(), 64);
    }
}
