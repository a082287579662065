// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use num_bigint_dig::{BigInt, BigUint};
use vts_channel_rs::codec::netint::{
    Netbytes, bytes_to_posint, bytes_to_signedint, netbytes_to_posint,
    netbytes_to_signedint, posint_to_bytes, posint_to_netbytes, signedint_to_bytes,
    signedint_to_netbytes,
};

#[test]
fn posint_minimal_encoding() {
    assert_eq!(posint_to_bytes(&BigUint::from(0u32)), vec![0x00]);
    assert_eq!(posint_to_bytes(&BigUint::from(1u32)), vec![0x01]);
    assert_eq!(posint_to_bytes(&BigUint::from(255u32)), vec![0xff]);
    assert_eq!(posint_to_bytes(&BigUint::from(256u32)), vec![0x01, 0x00]);
    // No redundant leading zero except for the zero value itself.
    for n in [1u64, 127, 128, 255, 256, 0xffff, 0x10000, u64::MAX] {
        let enc = posint_to_bytes(&BigUint::from(n));
        assert_ne!(enc[0], 0x00, "leading zero in encoding of {n}");
    }
}

#[test]
fn posint_roundtrip() {
    for n in [0u64, 1, 246, 247, 255, 4096, u64::MAX] {
        let big = BigUint::from(n);
        let enc = posint_to_bytes(&big);
        assert_eq!(bytes_to_posint(&enc).expect("decode"), big);
    }
    let huge = BigUint::from_bytes_be(&[0xab; 100]);
    assert_eq!(
        bytes_to_posint(&posint_to_bytes(&huge)).expect("decode"),
        huge
    );
}

#[test]
fn signed_roundtrip() {
    for n in [-1i64, 0, 1, -128, 127, -65536, 65535, i64::MIN + 1, i64::MAX] {
        let big = BigInt::from(n);
        let enc = signedint_to_bytes(&big);
        assert_eq!(bytes_to_signedint(&enc).expect("decode"), big);
    }
}

#[test]
fn netbytes_boundary_values() {
    assert_eq!(posint_to_netbytes(&BigUint::from(246u32)), vec![0xf6]);
    assert_eq!(posint_to_netbytes(&BigUint::from(247u32)), vec![0xf7, 0x00]);
    assert_eq!(posint_to_netbytes(&BigUint::from(248u32)), vec![0xf7, 0x01]);
}

#[test]
fn netbytes_roundtrip_returns_length() {
    for n in [0u64, 1, 246, 247, 248, 502, 503, 504, 0xffff, u64::MAX] {
        let big = BigUint::from(n);
        let enc = posint_to_netbytes(&big);
        match netbytes_to_posint(&enc) {
            Netbytes::Done { value, read } => {
                assert_eq!(value, big, "value mismatch for {n}");
                assert_eq!(read, enc.len(), "length mismatch for {n}");
            },
            Netbytes::Incomplete { .. } => panic!("incomplete decode for {n}"),
        }
    }
}

#[test]
fn netbytes_long_form_roundtrip() {
    // A payload longer than 8 bytes exercises the 0xFF long form.
    let huge = BigUint::from_bytes_be(&[0x5a; 40]);
    let enc = posint_to_netbytes(&huge);
    assert_eq!(enc[0], 0xff);
    match netbytes_to_posint(&enc) {
        Netbytes::Done { value, read } => {
            assert_eq!(value, huge);
            assert_eq!(read, enc.len());
        },
        Netbytes::Incomplete { .. } => panic!("incomplete decode"),
    }
}

#[test]
fn netbytes_incomplete_reports_estimate() {
    let enc = posint_to_netbytes(&BigUint::from(0x1234_5678u32));
    match netbytes_to_posint(&enc[..1]) {
        Netbytes::Incomplete { min, max } => {
            assert_eq!(min, max);
            let min = min.expect("estimate");
            // Enough information to reject an oversize value early.
            assert!(min >= 3);
        },
        Netbytes::Done { .. } => panic!("decode should be incomplete"),
    }
    assert_eq!(
        netbytes_to_posint(&[]),
        Netbytes::Incomplete {
            min: None,
            max: None
        }
    );
}

#[test]
fn signed_netbytes_roundtrip() {
    for n in [-1i64, 0, 1, -123, 123, -70000, 70000] {
        let big = BigInt::from(n);
        let enc = signedint_to_netbytes(&big);
        match netbytes_to_signedint(&enc) {
            Netbytes::Done { value, read } => {
                assert_eq!(value, big);
                assert_eq!(read, enc.len());
            },
            Netbytes::Incomplete { .. } => panic!("incomplete decode for {n}"),
        }
    }
}
