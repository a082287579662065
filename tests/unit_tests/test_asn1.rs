// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use chrono::{TimeZone, Utc};
use hex_literal::hex;
use vts_channel_rs::asn1::{
    Def, Oid, SequenceDef, Tag, TaggedValue, Value, value::Constructed,
};

#[test]
fn oid_rsa_encryption_vector() {
    let oid = Oid::new(&[1, 2, 840, 113549, 1, 1, 1]);
    let der = Value::ObjectIdentifier(oid.clone())
        .encode_der()
        .expect("encode");
    assert_eq!(der, hex!("06 09 2A 86 48 86 F7 0D 01 01 01"));
    let (value, used) = Value::from_der(&der).expect("parse");
    assert_eq!(used, der.len());
    assert_eq!(value.as_oid(), Some(&oid));
}

#[test]
fn boolean_der_vectors() {
    assert_eq!(
        Value::Boolean(true).encode_der().expect("encode"),
        hex!("01 01 FF")
    );
    assert_eq!(
        Value::Boolean(false).encode_der().expect("encode"),
        hex!("01 01 00")
    );
    let (value, _) = Value::from_der(&hex!("01 01 FF")).expect("parse");
    assert_eq!(value, Value::Boolean(true));
    // Any other content octet violates DER.
    assert!(Value::from_der(&hex!("01 01 01")).is_err());
}

#[test]
fn small_integer_vectors() {
    let cases: [(i64, &[u8]); 4] = [
        (0, &hex!("02 01 00")),
        (-1, &hex!("02 01 FF")),
        (127, &hex!("02 01 7F")),
        (128, &hex!("02 02 00 80")),
    ];
    for (n, expected) in cases {
        let der = Value::integer(n).encode_der().expect("encode");
        assert_eq!(der, expected, "integer {n}");
        let (value, _) = Value::from_der(&der).expect("parse");
        assert_eq!(value, Value::integer(n));
    }
}

#[test]
fn redundant_integer_octets_rejected() {
    // 0x0001 must encode as a single octet.
    assert!(Value::from_der(&hex!("02 02 00 01")).is_err());
    assert!(Value::from_der(&hex!("02 02 FF 80")).is_err());
}

#[test]
fn utc_time_boundary() {
    let t = Utc.with_ymd_and_hms(2011, 1, 1, 0, 0, 0).single().expect("valid time");
    let der = Value::UtcTime(t).encode_der().expect("encode");
    let mut expected = vec![0x17, 13];
    expected.extend_from_slice(b"110101000000Z");
    assert_eq!(der, expected);
    let (value, _) = Value::from_der(&der).expect("parse");
    assert_eq!(value.as_time(), Some(&t));
}

#[test]
fn generalized_time_strips_trailing_zeros() {
    let t = Utc
        .with_ymd_and_hms(2061, 6, 15, 12, 30, 45)
        .single()
        .expect("valid time")
        + chrono::Duration::microseconds(120_000);
    let der = Value::GeneralizedTime(t).encode_der().expect("encode");
    let body = &der[2..];
    assert_eq!(body, b"20610615123045.12Z");
    let (value, _) = Value::from_der(&der).expect("parse");
    assert_eq!(value.as_time(), Some(&t));
}

#[test]
fn set_elements_sorted_lexicographically() {
    let mut set = Constructed::new();
    set.push(Value::integer(0x0203));
    set.push(Value::Boolean(true));
    set.push(Value::integer(1));
    let der = Value::SetOf(set).encode_der().expect("encode");
    // Boolean (tag 0x01) sorts before both integers; the one-octet
    // integer sorts before the two-octet one.
    assert_eq!(der[0], 0x31);
    let content = &der[2..];
    assert_eq!(content, hex!("0101FF 020101 02020203"));
}

#[test]
fn explicit_and_implicit_tagging() {
    let inner = Value::integer(5);
    let explicit = Value::Tagged(Box::new(TaggedValue {
        tag: Tag::context(0),
        explicit: true,
        inner: inner.clone(),
    }));
    assert_eq!(explicit.encode_der().expect("encode"), hex!("A0 03 02 01 05"));

    let implicit = Value::Tagged(Box::new(TaggedValue {
        tag: Tag::context(2),
        explicit: false,
        inner,
    }));
    assert_eq!(implicit.encode_der().expect("encode"), hex!("82 01 05"));

    let exp_def = Def::explicit(0, Def::Integer);
    let (parsed, _) = exp_def.parse(&hex!("A0 03 02 01 05")).expect("parse");
    assert_eq!(parsed.untagged(), &Value::integer(5));

    let imp_def = Def::implicit(2, Def::Integer);
    let (parsed, _) = imp_def.parse(&hex!("82 01 05")).expect("parse");
    assert_eq!(parsed.untagged(), &Value::integer(5));

    assert!(exp_def.parse(&hex!("A1 03 02 01 05")).is_err());
}

#[test]
fn sequence_parser_defaults_and_optionals() {
    let def = Def::sequence(
        SequenceDef::new()
            .field(Def::Integer, "serial")
            .with_default(Def::Boolean, "flag", Value::Boolean(false))
            .optional(Def::Utf8String, "comment"),
    );

    // Only the required element present: default supplied, optional
    // skipped.
    let der = {
        let mut seq = Constructed::new();
        seq.push(Value::integer(9));
        Value::Sequence(seq).encode_der().expect("encode")
    };
    let value = def.parse_exact(&der).expect("parse");
    let seq = value.as_constructed().expect("sequence");
    assert_eq!(seq.get("serial"), Some(&Value::integer(9)));
    assert_eq!(seq.get("flag"), Some(&Value::Boolean(false)));
    assert_eq!(seq.get_explicit("flag"), None);
    assert_eq!(seq.get("comment"), None);

    // Extra unmatched elements after the declared slots are an error.
    let der = {
        let mut seq = Constructed::new();
        seq.push(Value::integer(9));
        seq.push(Value::Boolean(true));
        seq.push(Value::Utf8String("note".into()));
        seq.push(Value::Null);
        Value::Sequence(seq).encode_der().expect("encode")
    };
    assert!(def.parse_exact(&der).is_err());

    // Missing required element fails.
    let der = Value::Sequence(Constructed::new())
        .encode_der()
        .expect("encode");
    assert!(def.parse_exact(&der).is_err());
}

#[test]
fn set_parser_is_tag_indexed() {
    let def = Def::set(
        SequenceDef::new()
            .field(Def::Integer, "number")
            .optional(Def::Boolean, "flag"),
    );
    // Order on the wire differs from declaration order.
    let der = {
        let mut set = Constructed::new();
        set.push(Value::Boolean(true));
        set.push(Value::integer(3));
        Value::Set(set).encode_der().expect("encode")
    };
    let value = def.parse_exact(&der).expect("parse");
    let set = value.as_constructed().expect("set");
    assert_eq!(set.get("number"), Some(&Value::integer(3)));
    assert_eq!(set.get("flag"), Some(&Value::Boolean(true)));

    // Unknown tags in a set are an error.
    let der = {
        let mut set = Constructed::new();
        set.push(Value::Utf8String("nope".into()));
        Value::Set(set).encode_der().expect("encode")
    };
    assert!(def.parse_exact(&der).is_err());
}

#[test]
fn universal_parser_unknown_handling() {
    let tagged = Value::Tagged(Box::new(TaggedValue {
        tag: Tag::context(7),
        explicit: true,
        inner: Value::integer(1),
    }));
    let der = tagged.encode_der().expect("encode");

    assert!(Value::from_der(&der).is_err());
    let (value, used) = Value::from_der_opts(&der, true).expect("parse");
    assert_eq!(used, der.len());
    let Value::Unknown(tag, raw) = &value else {
        panic!("expected unknown wrapper");
    };
    assert_eq!(*tag, Tag::context(7));
    assert_eq!(*raw, der);
    // The wrapper re-emits its captured bytes.
    assert_eq!(value.encode_der().expect("encode"), der);
}

#[test]
fn der_reemission_is_canonical() {
    let mut inner = Constructed::new();
    inner.push_named(Value::integer(42), "id");
    inner.push_named(Value::Utf8String("canonical".into()), "label");
    let mut outer = Constructed::new();
    outer.push(Value::Sequence(inner));
    outer.push(Value::OctetString(vec![1, 2, 3]));
    let value = Value::Sequence(outer);

    let der = value.encode_der().expect("encode");
    let (parsed, used) = Value::from_der(&der).expect("parse");
    assert_eq!(used, der.len());
    assert_eq!(parsed.encode_der().expect("re-encode"), der);
}

#[test]
fn indefinite_length_rejected() {
    assert!(Value::from_der(&hex!("30 80 01 01 FF 00 00")).is_err());
}
