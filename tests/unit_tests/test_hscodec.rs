// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use num_bigint_dig::BigInt;
use vts_channel_rs::{
    codec::hsvalue::{HsReader, HsValue, HsWriter},
    io::buf::ByteBuf,
};

fn sample_value() -> HsValue {
    HsValue::Tuple(vec![
        HsValue::Null,
        HsValue::Bool(true),
        HsValue::Bool(false),
        HsValue::int(-123456789i64),
        HsValue::Int(BigInt::from_signed_bytes_be(&[0x7f; 48])),
        HsValue::bytes(vec![0u8, 1, 2, 255]),
        HsValue::str("negotiate"),
        HsValue::Tuple(vec![
            HsValue::str("aes256"),
            HsValue::Tuple(vec![HsValue::str("cbc"), HsValue::str("ofb")]),
        ]),
    ])
}

#[test]
fn value_roundtrip_single_read() {
    let value = sample_value();
    let wire = value.encode();
    let buf = ByteBuf::from_slice(&wire);
    let mut reader = HsReader::new(None);
    assert!(reader.read(&buf).expect("read"));
    assert!(buf.is_empty());
    assert_eq!(reader.num_read(), wire.len());
    assert_eq!(reader.result().expect("result"), value);
}

#[test]
fn reader_is_incremental_and_leaves_trailing_bytes() {
    let value = sample_value();
    let mut wire = value.encode();
    let msg_len = wire.len();
    wire.extend_from_slice(b"TRAILING");

    let buf = ByteBuf::new();
    let mut reader = HsReader::new(None);
    for chunk in wire.chunks(5) {
        buf.append_slice(chunk);
        if reader.read(&buf).expect("read") {
            break;
        }
    }
    assert!(reader.done());
    assert_eq!(reader.num_read(), msg_len);
    assert_eq!(reader.result().expect("result"), value);
    // Everything after the message stays for the next stage.
    let mut rest = buf.pop_all();
    // Some trailing bytes may not have been appended yet.
    rest.truncate(8);
    assert!(b"TRAILING".starts_with(rest.as_slice()));
}

#[test]
fn reader_enforces_message_limit() {
    let value = HsValue::bytes(vec![0xaa; 4096]);
    let wire = value.encode();
    let buf = ByteBuf::from_slice(&wire);
    let mut reader = HsReader::new(Some(64));
    assert!(reader.read(&buf).is_err());
}

#[test]
fn reader_rejects_oversize_length_early() {
    // Bytes tag with an absurd netbytes length; the payload never
    // arrives, and the reader must not wait for it.
    let mut wire = vec![0x04];
    let huge = BigInt::from(u64::MAX);
    let as_unsigned = huge.to_biguint().expect("positive");
    wire.extend_from_slice(&vts_channel_rs::codec::netint::posint_to_netbytes(
        &as_unsigned,
    ));
    let buf = ByteBuf::from_slice(&wire);
    let mut reader = HsReader::new(Some(16384));
    assert!(reader.read(&buf).is_err());
}

#[test]
fn writer_streams_bounded_chunks() {
    let value = sample_value();
    let wire = value.encode();
    let mut writer = HsWriter::new(&value);
    let mut out = Vec::new();
    while !writer.done() {
        let chunk = writer.write(7);
        assert!(chunk.len() <= 7);
        assert!(!chunk.is_empty());
        out.extend_from_slice(chunk);
    }
    assert_eq!(out, wire);
    assert!(writer.write(7).is_empty());
}

#[test]
fn unknown_tag_is_rejected() {
    let buf = ByteBuf::from_slice(&[0x42, 0x00]);
    let mut reader = HsReader::new(None);
    assert!(reader.read(&buf).is_err());
}
