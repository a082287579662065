// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Self-delimiting tuple codec for secure-channel handshake payloads.
//!
//! Handshake messages are tuples over a small closed value set: null,
//! booleans, arbitrary-precision integers, byte strings, UTF-8 strings
//! and nested tuples. Every value is a one-byte type tag followed by a
//! netbytes length/arity prefix and the payload, so a message is fully
//! self-delimiting and can be cut out of a ciphertext stream without a
//! wrapping length field.
//!
//! The [`HsReader`] accumulates wire bytes incrementally and enforces a
//! total message limit while the message is still partial, which is the
//! defense the channel configuration's `hshake_lim` relies on.

use num_bigint_dig::BigInt;
use num_traits::ToPrimitive;

use crate::{
    codec::netint::{self, Netbytes},
    error::{Error, Result},
    io::buf::ByteBuf,
};

const TAG_NULL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_BYTES: u8 = 0x04;
const TAG_STR: u8 = 0x05;
const TAG_TUPLE: u8 = 0x06;

/// Maximum tuple nesting accepted from a peer.
const MAX_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HsValue {
    Null,
    Bool(bool),
    Int(BigInt),
    Bytes(Vec<u8>),
    Str(String),
    Tuple(Vec<HsValue>),
}

impl HsValue {
    pub fn str(s: impl Into<String>) -> Self {
        HsValue::Str(s.into())
    }

    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        HsValue::Bytes(data.into())
    }

    pub fn int(n: impl Into<BigInt>) -> Self {
        HsValue::Int(n.into())
    }

    /// `None` maps to `Null`, matching optional handshake fields.
    pub fn opt_int(n: Option<impl Into<BigInt>>) -> Self {
        match n {
            Some(n) => HsValue::Int(n.into()),
            None => HsValue::Null,
        }
    }

    pub fn as_tuple(&self) -> Option<&[HsValue]> {
        match self {
            HsValue::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            HsValue::Bytes(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HsValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<&BigInt> {
        match self {
            HsValue::Int(n) => Some(n),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, HsValue::Null)
    }

    /// Interprets a `Null`-or-positive-int field, rejecting other shapes.
    pub fn as_opt_positive(&self, what: &str) -> Result<Option<u64>> {
        match self {
            HsValue::Null => Ok(None),
            HsValue::Int(n) => {
                let v = n
                    .to_u64()
                    .filter(|v| *v > 0)
                    .ok_or_else(|| Error::protocol(format!("invalid {what}")))?;
                Ok(Some(v))
            },
            _ => Err(Error::protocol(format!("invalid {what}"))),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            HsValue::Null => out.push(TAG_NULL),
            HsValue::Bool(false) => out.push(TAG_FALSE),
            HsValue::Bool(true) => out.push(TAG_TRUE),
            HsValue::Int(n) => {
                out.push(TAG_INT);
                out.extend_from_slice(&netint::signedint_to_netbytes(n));
            },
            HsValue::Bytes(data) => {
                out.push(TAG_BYTES);
                out.extend_from_slice(&netint::u64_to_netbytes(data.len() as u64));
                out.extend_from_slice(data);
            },
            HsValue::Str(s) => {
                out.push(TAG_STR);
                out.extend_from_slice(&netint::u64_to_netbytes(s.len() as u64));
                out.extend_from_slice(s.as_bytes());
            },
            HsValue::Tuple(items) => {
                out.push(TAG_TUPLE);
                out.extend_from_slice(&netint::u64_to_netbytes(items.len() as u64));
                for item in items {
                    item.encode_into(out);
                }
            },
        }
    }
}

/// Outcome of a decode attempt over a partial input.
#[derive(Debug)]
enum Decoded {
    Done(HsValue, usize),
    Incomplete,
}

fn decode_len(data: &[u8], max_len: usize) -> Result<Option<(usize, usize)>> {
    match netint::netbytes_to_u64(data) {
        Ok(Netbytes::Done { value, read }) => {
            let len = value
                .to_usize()
                .filter(|len| *len <= max_len)
                .ok_or_else(|| Error::protocol("handshake element too large"))?;
            Ok(Some((len, read)))
        },
        Ok(Netbytes::Incomplete { min, .. }) => {
            // An oversize length can be rejected before it is complete.
            if min.is_some_and(|min| min > 8) {
                return Err(Error::protocol("handshake element too large"));
            }
            Ok(None)
        },
        Err(_) => Err(Error::protocol("handshake element too large")),
    }
}

fn decode_value(data: &[u8], depth: usize, max_len: usize) -> Result<Decoded> {
    if depth > MAX_DEPTH {
        return Err(Error::protocol("handshake value nested too deeply"));
    }
    let Some(&tag) = data.first() else {
        return Ok(Decoded::Incomplete);
    };
    let rest = &data[1..];
    match tag {
        TAG_NULL => Ok(Decoded::Done(HsValue::Null, 1)),
        TAG_FALSE => Ok(Decoded::Done(HsValue::Bool(false), 1)),
        TAG_TRUE => Ok(Decoded::Done(HsValue::Bool(true), 1)),
        TAG_INT => match netint::netbytes_to_signedint(rest) {
            Netbytes::Done { value, read } => {
                Ok(Decoded::Done(HsValue::Int(value), 1 + read))
            },
            Netbytes::Incomplete { min, .. } => {
                if min.is_some_and(|min| min > max_len) {
                    return Err(Error::protocol("handshake element too large"));
                }
                Ok(Decoded::Incomplete)
            },
        },
        TAG_BYTES | TAG_STR => {
            let Some((len, read)) = decode_len(rest, max_len)? else {
                return Ok(Decoded::Incomplete);
            };
            let payload = &rest[read..];
            if payload.len() < len {
                return Ok(Decoded::Incomplete);
            }
            let payload = &payload[..len];
            let value = if tag == TAG_BYTES {
                HsValue::Bytes(payload.to_vec())
            } else {
                let s = std::str::from_utf8(payload)
                    .map_err(|_| Error::parse("handshake string is not UTF-8"))?;
                HsValue::Str(s.to_string())
            };
            Ok(Decoded::Done(value, 1 + read + len))
        },
        TAG_TUPLE => {
            let Some((arity, read)) = decode_len(rest, max_len)? else {
                return Ok(Decoded::Incomplete);
            };
            let mut used = 1 + read;
            let mut items = Vec::with_capacity(arity.min(64));
            for _ in 0..arity {
                match decode_value(&data[used..], depth + 1, max_len)? {
                    Decoded::Done(item, n) => {
                        items.push(item);
                        used += n;
                    },
                    Decoded::Incomplete => return Ok(Decoded::Incomplete),
                }
            }
            Ok(Decoded::Done(HsValue::Tuple(items), used))
        },
        other => Err(Error::parse(format!(
            "unknown handshake value tag 0x{other:02x}"
        ))),
    }
}

/// Incremental handshake message reader with a total size limit.
#[derive(Debug)]
pub struct HsReader {
    limit: Option<usize>,
    result: Option<HsValue>,
    num_read: usize,
}

impl HsReader {
    pub fn new(limit: Option<usize>) -> Self {
        HsReader {
            limit,
            result: None,
            num_read: 0,
        }
    }

    /// Consumes as many bytes from `buf` as belong to the current
    /// message. Returns true once the message is complete; bytes beyond
    /// the message remain in `buf`.
    pub fn read(&mut self, buf: &ByteBuf) -> Result<bool> {
        if self.result.is_some() {
            return Ok(true);
        }
        let data = buf.peek_all();
        let max_len = self.limit.unwrap_or(usize::MAX);
        match decode_value(&data, 0, max_len)? {
            Decoded::Done(value, used) => {
                if used > max_len {
                    return Err(Error::protocol("handshake message limit exceeded"));
                }
                buf.remove(used);
                self.num_read = used;
                self.result = Some(value);
                Ok(true)
            },
            Decoded::Incomplete => {
                if data.len() > max_len {
                    return Err(Error::protocol("handshake message limit exceeded"));
                }
                Ok(false)
            },
        }
    }

    pub fn done(&self) -> bool {
        self.result.is_some()
    }

    pub fn num_read(&self) -> usize {
        self.num_read
    }

    pub fn result(self) -> Result<HsValue> {
        self.result
            .ok_or_else(|| Error::parse("handshake message not complete"))
    }
}

/// Streams a serialized handshake message out in bounded chunks.
#[derive(Debug)]
pub struct HsWriter {
    data: Vec<u8>,
    pos: usize,
}

impl HsWriter {
    pub fn new(value: &HsValue) -> Self {
        HsWriter {
            data: value.encode(),
            pos: 0,
        }
    }

    /// Returns the next chunk of at most `max` bytes.
    pub fn write(&mut self, max: usize) -> &[u8] {
        let end = (self.pos + max).min(self.data.len());
        let chunk = &self.data[self.pos..end];
        self.pos = end;
        chunk
    }

    pub fn done(&self) -> bool {
        self.pos >= self.data.len()
    }
}
