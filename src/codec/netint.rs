// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Integer byte codecs and the self-delimiting netbytes length prefix.
//!
//! `posint`/`signedint` conversions use the minimal big-endian form
//! (zero encodes as a single zero byte). The netbytes form is
//! self-delimiting: values up to 246 are one byte, larger values carry
//! a length nibble (`246 + k` for a k-byte payload of `value - 247`),
//! and payloads longer than 8 bytes recurse through a `0xFF` marker.
//!
//! The incremental decoders report a `(min, max)` estimate of the
//! payload length when input is short, so callers can reject oversize
//! values without decoding them.

use num_bigint_dig::{BigInt, BigUint, Sign};
use num_integer::Integer;
use num_traits::ToPrimitive;

use crate::error::{Error, Result};

/// Minimal big-endian unsigned encoding; `0` encodes as one zero byte.
pub fn posint_to_bytes(n: &BigUint) -> Vec<u8> {
    n.to_bytes_be()
}

/// Inverse of [`posint_to_bytes`].
pub fn bytes_to_posint(data: &[u8]) -> Result<BigUint> {
    if data.is_empty() {
        return Err(Error::parse("empty integer encoding"));
    }
    Ok(BigUint::from_bytes_be(data))
}

/// Encodes `2n` for `n >= 0` and `2|n| + 1` for negative `n`.
pub fn signedint_to_bytes(n: &BigInt) -> Vec<u8> {
    posint_to_bytes(&fold_signed(n))
}

/// Inverse of [`signedint_to_bytes`].
pub fn bytes_to_signedint(data: &[u8]) -> Result<BigInt> {
    Ok(unfold_signed(&bytes_to_posint(data)?))
}

fn fold_signed(n: &BigInt) -> BigUint {
    let two = BigInt::from(2u32);
    let folded = if n.sign() == Sign::Minus {
        -(n * &two) + BigInt::from(1u32)
    } else {
        n * &two
    };
    folded.to_biguint().expect("folded value is non-negative")
}

fn unfold_signed(unsigned: &BigUint) -> BigInt {
    let as_int = BigInt::from_biguint(Sign::Plus, unsigned.clone());
    if unsigned.is_odd() {
        -(as_int >> 1)
    } else {
        as_int >> 1
    }
}

/// Self-delimiting netbytes encoding of a non-negative integer.
pub fn posint_to_netbytes(n: &BigUint) -> Vec<u8> {
    if let Some(small) = n.to_u64()
        && small <= 246
    {
        return vec![small as u8];
    }

    let m = n - 247u32;
    let data = posint_to_bytes(&m);
    let mut out = Vec::with_capacity(data.len() + 2);
    if data.len() <= 8 {
        out.push(246 + data.len() as u8);
    } else {
        out.push(0xff);
        out.extend_from_slice(&posint_to_netbytes(&BigUint::from(
            (data.len() - 9) as u64,
        )));
    }
    out.extend_from_slice(&data);
    out
}

/// Netbytes encoding of a signed integer (2n / 2|n|+1 folding).
pub fn signedint_to_netbytes(n: &BigInt) -> Vec<u8> {
    posint_to_netbytes(&fold_signed(n))
}

/// Outcome of an incremental netbytes decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Netbytes<T> {
    /// Fully decoded value and the number of bytes consumed.
    Done { value: T, read: usize },
    /// Not enough input. `min`/`max` bound the length in bytes of the
    /// standard encoding of `value - 247`, when an estimate is known.
    Incomplete {
        min: Option<usize>,
        max: Option<usize>,
    },
}

/// Decodes a netbytes-encoded non-negative integer.
pub fn netbytes_to_posint(data: &[u8]) -> Netbytes<BigUint> {
    let Some(&first) = data.first() else {
        return Netbytes::Incomplete {
            min: None,
            max: None,
        };
    };

    if first <= 246 {
        return Netbytes::Done {
            value: BigUint::from(first),
            read: 1,
        };
    }

    if first < 255 {
        let k = (first - 246) as usize;
        if data.len() >= k + 1 {
            let value = BigUint::from_bytes_be(&data[1..=k]) + 247u32;
            return Netbytes::Done {
                value,
                read: k + 1,
            };
        }
        return Netbytes::Incomplete {
            min: Some(k),
            max: Some(k),
        };
    }

    // Long form: the payload length itself is netbytes-encoded as k - 9.
    match netbytes_to_posint(&data[1..]) {
        Netbytes::Done { value, read } => {
            let Some(k) = value.to_usize().and_then(|v| v.checked_add(9)) else {
                return Netbytes::Incomplete {
                    min: Some(usize::MAX),
                    max: None,
                };
            };
            if data.len() >= 1 + read + k {
                let payload = &data[1 + read..1 + read + k];
                let value = BigUint::from_bytes_be(payload) + 247u32;
                Netbytes::Done {
                    value,
                    read: 1 + read + k,
                }
            } else {
                Netbytes::Incomplete {
                    min: Some(k),
                    max: Some(k),
                }
            }
        },
        Netbytes::Incomplete { min, max } => Netbytes::Incomplete {
            min: min.or(Some(9)),
            max,
        },
    }
}

/// Decodes a netbytes-encoded signed integer.
pub fn netbytes_to_signedint(data: &[u8]) -> Netbytes<BigInt> {
    match netbytes_to_posint(data) {
        Netbytes::Done { value, read } => Netbytes::Done {
            value: unfold_signed(&value),
            read,
        },
        Netbytes::Incomplete { min, max } => Netbytes::Incomplete { min, max },
    }
}

/// Shorthand for encoding machine-sized counters and lengths.
pub fn u64_to_netbytes(n: u64) -> Vec<u8> {
    posint_to_netbytes(&BigUint::from(n))
}

/// Decodes a netbytes value expected to fit in `u64`, e.g. a length.
pub fn netbytes_to_u64(data: &[u8]) -> Result<Netbytes<u64>> {
    match netbytes_to_posint(data) {
        Netbytes::Done { value, read } => {
            let value = value
                .to_u64()
                .ok_or_else(|| Error::parse("netbytes value out of range"))?;
            Ok(Netbytes::Done { value, read })
        },
        Netbytes::Incomplete { min, max } => Ok(Netbytes::Incomplete { min, max }),
    }
}
