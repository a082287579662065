// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Certificate extensions.
//!
//! Recognized extensions parse into typed data; anything else is kept
//! as raw `(oid, critical, value)` so it survives a re-encode.

use bitflags::bitflags;
use num_bigint_dig::BigInt;
use num_traits::{Signed, ToPrimitive};
use sha1::{Digest, Sha1};

use crate::{
    asn1::{
        BitString, Def, Oid, SequenceDef, Tag, TagClass, Value,
        def::element_span,
        tag as asn1_tag,
        value::Constructed,
    },
    crypto::rsa::RsaKey,
    error::{Error, Result},
    x509::{
        AUTHORITY_KEY_ID_OID, BASIC_CONSTRAINTS_OID, KEY_USAGE_OID,
        SUBJECT_KEY_ID_OID, keys,
    },
};

bitflags! {
    /// X.509 KeyUsage bits, bit 0 first on the wire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KeyUsageFlags: u16 {
        const DIGITAL_SIGNATURE = 1 << 0;
        const NON_REPUDIATION   = 1 << 1;
        const KEY_ENCIPHERMENT  = 1 << 2;
        const DATA_ENCIPHERMENT = 1 << 3;
        const KEY_AGREEMENT     = 1 << 4;
        const KEY_CERT_SIGN     = 1 << 5;
        const CRL_SIGN          = 1 << 6;
        const ENCIPHER_ONLY     = 1 << 7;
        const DECIPHER_ONLY     = 1 << 8;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtensionData {
    BasicConstraints {
        is_ca: bool,
        path_len: Option<u64>,
    },
    SubjectKeyIdentifier(Vec<u8>),
    KeyUsage(KeyUsageFlags),
    AuthorityKeyIdentifier {
        key_id: Option<Vec<u8>>,
        /// Raw `[1]` GeneralNames element, kept verbatim.
        issuer: Option<Vec<u8>>,
        serial: Option<BigInt>,
    },
    /// Unrecognized extension value octets.
    Unknown(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extension {
    pub oid: Oid,
    pub critical: bool,
    pub data: ExtensionData,
}

impl Extension {
    pub fn basic_constraints(
        critical: bool,
        is_ca: bool,
        path_len: Option<u64>,
    ) -> Extension {
        Extension {
            oid: BASIC_CONSTRAINTS_OID.clone(),
            critical,
            data: ExtensionData::BasicConstraints { is_ca, path_len },
        }
    }

    /// SubjectKeyIdentifier is never critical.
    pub fn subject_key_identifier(identifier: Vec<u8>) -> Extension {
        Extension {
            oid: SUBJECT_KEY_ID_OID.clone(),
            critical: false,
            data: ExtensionData::SubjectKeyIdentifier(identifier),
        }
    }

    pub fn key_usage(critical: bool, bits: KeyUsageFlags) -> Extension {
        Extension {
            oid: KEY_USAGE_OID.clone(),
            critical,
            data: ExtensionData::KeyUsage(bits),
        }
    }

    /// AuthorityKeyIdentifier is never critical.
    pub fn authority_key_identifier(key_id: Option<Vec<u8>>) -> Extension {
        Extension {
            oid: AUTHORITY_KEY_ID_OID.clone(),
            critical: false,
            data: ExtensionData::AuthorityKeyIdentifier {
                key_id,
                issuer: None,
                serial: None,
            },
        }
    }

    /// Identifier derivation method 1: SHA-1 of the subjectPublicKey
    /// content octets (the PKCS#1 public key DER).
    pub fn key_to_identifier(key: &RsaKey) -> Result<Vec<u8>> {
        let der = keys::public_key_der(key)?;
        Ok(Sha1::digest(&der).to_vec())
    }

    /// Extension set granting CA signing rights.
    pub fn ca_extensions(
        ca_pub_key: &RsaKey,
        path_len: Option<u64>,
        usage_bits: Option<KeyUsageFlags>,
    ) -> Result<Vec<Extension>> {
        let usage = usage_bits
            .unwrap_or(KeyUsageFlags::KEY_CERT_SIGN | KeyUsageFlags::CRL_SIGN);
        Ok(vec![
            Extension::basic_constraints(true, true, path_len),
            Extension::subject_key_identifier(Extension::key_to_identifier(
                ca_pub_key,
            )?),
            Extension::key_usage(true, usage),
        ])
    }

    pub fn subject_key_id(&self) -> Option<&[u8]> {
        match &self.data {
            ExtensionData::SubjectKeyIdentifier(id) => Some(id),
            _ => None,
        }
    }

    pub fn authority_key_id(&self) -> Option<&[u8]> {
        match &self.data {
            ExtensionData::AuthorityKeyIdentifier {
                key_id: Some(id), ..
            } => Some(id),
            _ => None,
        }
    }

    /// Value octets (the contents of the extension OCTET STRING).
    pub fn value_der(&self) -> Result<Vec<u8>> {
        match &self.data {
            ExtensionData::BasicConstraints { is_ca, path_len } => {
                let mut seq = Constructed::new();
                if *is_ca {
                    seq.push_named(Value::Boolean(true), "ca");
                }
                if let Some(n) = path_len {
                    seq.push_named(Value::integer(*n as i64), "path_len");
                }
                Value::Sequence(seq).encode_der()
            },
            ExtensionData::SubjectKeyIdentifier(id) => {
                Value::OctetString(id.clone()).encode_der()
            },
            ExtensionData::KeyUsage(flags) => {
                let bits: Vec<bool> =
                    (0..9).map(|i| flags.bits() & (1 << i) != 0).collect();
                Value::BitString(BitString::from_bits(&bits)).encode_der()
            },
            ExtensionData::AuthorityKeyIdentifier {
                key_id,
                issuer,
                serial,
            } => {
                let mut seq = Constructed::new();
                if let Some(id) = key_id {
                    let mut der = vec![0x80];
                    der.extend_from_slice(&asn1_tag::encode_length(id.len()));
                    der.extend_from_slice(id);
                    seq.push(Value::Unknown(Tag::context(0), der));
                }
                if let Some(raw) = issuer {
                    seq.push(Value::Unknown(Tag::context(1), raw.clone()));
                }
                if let Some(n) = serial {
                    let content = n.to_signed_bytes_be();
                    let mut der = vec![0x82];
                    der.extend_from_slice(&asn1_tag::encode_length(content.len()));
                    der.extend_from_slice(&content);
                    seq.push(Value::Unknown(Tag::context(2), der));
                }
                Value::Sequence(seq).encode_der()
            },
            ExtensionData::Unknown(raw) => Ok(raw.clone()),
        }
    }

    /// The `Extension` SEQUENCE value for the TBS extension list.
    pub fn to_asn1(&self) -> Result<Value> {
        let mut seq = Constructed::new();
        seq.push_named(Value::ObjectIdentifier(self.oid.clone()), "extnID");
        if self.critical {
            seq.push_named(Value::Boolean(true), "critical");
        } else {
            seq.push_default(Value::Boolean(false), Some("critical".to_string()));
        }
        seq.push_named(Value::OctetString(self.value_der()?), "extnValue");
        Ok(Value::Sequence(seq))
    }

    /// Parse template for one `Extension` SEQUENCE.
    pub fn def() -> Def {
        Def::sequence(
            SequenceDef::new()
                .field(Def::ObjectIdentifier, "extnID")
                .with_default(Def::Boolean, "critical", Value::Boolean(false))
                .field(Def::OctetString, "extnValue"),
        )
    }

    pub fn from_asn1(value: &Value) -> Result<Extension> {
        let seq = value
            .as_constructed()
            .ok_or_else(|| Error::parse("extension is not a sequence"))?;
        let oid = seq
            .get("extnID")
            .and_then(Value::as_oid)
            .ok_or_else(|| Error::parse("extension id missing"))?
            .clone();
        let critical = match seq.get("critical") {
            Some(Value::Boolean(b)) => *b,
            _ => false,
        };
        let raw = seq
            .get("extnValue")
            .and_then(Value::as_octets)
            .ok_or_else(|| Error::parse("extension value missing"))?;
        let data = Extension::parse_data(&oid, raw)
            .map_err(|_| Error::parse("Bad extension value DER encoding"))?;
        Ok(Extension {
            oid,
            critical,
            data,
        })
    }

    fn parse_data(oid: &Oid, raw: &[u8]) -> Result<ExtensionData> {
        if *oid == *BASIC_CONSTRAINTS_OID {
            let def = Def::sequence(
                SequenceDef::new()
                    .with_default(Def::Boolean, "ca", Value::Boolean(false))
                    .optional(Def::Integer, "path_len"),
            );
            let value = def.parse_exact(raw)?;
            let seq = value
                .as_constructed()
                .ok_or_else(|| Error::parse("bad BasicConstraints"))?;
            let is_ca = matches!(seq.get("ca"), Some(Value::Boolean(true)));
            let path_len = match seq.get_explicit("path_len") {
                Some(v) => {
                    let n = v
                        .as_integer()
                        .ok_or_else(|| Error::parse("bad path length"))?;
                    if n.is_negative() {
                        return Err(Error::validation(
                            "path length must be non-negative",
                        ));
                    }
                    Some(
                        n.to_u64()
                            .ok_or_else(|| Error::parse("bad path length"))?,
                    )
                },
                None => None,
            };
            Ok(ExtensionData::BasicConstraints { is_ca, path_len })
        } else if *oid == *SUBJECT_KEY_ID_OID {
            let value = Def::OctetString.parse_exact(raw)?;
            let id = value
                .as_octets()
                .ok_or_else(|| Error::parse("bad SubjectKeyIdentifier"))?;
            Ok(ExtensionData::SubjectKeyIdentifier(id.to_vec()))
        } else if *oid == *KEY_USAGE_OID {
            let value = Def::BitString.parse_exact(raw)?;
            let bits = value
                .as_bit_string()
                .ok_or_else(|| Error::parse("bad KeyUsage"))?;
            let mut flags = KeyUsageFlags::empty();
            for i in 0..9 {
                if bits.bit(i) {
                    flags |= KeyUsageFlags::from_bits_truncate(1 << i);
                }
            }
            Ok(ExtensionData::KeyUsage(flags))
        } else if *oid == *AUTHORITY_KEY_ID_OID {
            Extension::parse_aki(raw)
        } else {
            Ok(ExtensionData::Unknown(raw.to_vec()))
        }
    }

    fn parse_aki(raw: &[u8]) -> Result<ExtensionData> {
        // The slots are context-tagged; [1] GeneralNames is kept raw.
        let (content, total) = split_sequence(raw)?;
        if total != raw.len() {
            return Err(Error::parse("bad AuthorityKeyIdentifier"));
        }
        let mut key_id = None;
        let mut issuer = None;
        let mut serial = None;
        let mut offset = 0;
        while offset < content.len() {
            let rest = &content[offset..];
            let (t, _, id_len) = Tag::decode(rest)?;
            let span = element_span(rest)?;
            let (len, len_len) = asn1_tag::decode_length(&rest[id_len..])?;
            let len =
                len.ok_or_else(|| Error::parse("Indefinite length not supported"))?;
            let inner = &rest[id_len + len_len..id_len + len_len + len];
            if t.class != TagClass::Context {
                return Err(Error::parse("bad AuthorityKeyIdentifier"));
            }
            match t.number {
                0 => key_id = Some(inner.to_vec()),
                1 => issuer = Some(rest[..span].to_vec()),
                2 => {
                    serial = Some(BigInt::from_signed_bytes_be(inner));
                },
                _ => return Err(Error::parse("bad AuthorityKeyIdentifier")),
            }
            offset += span;
        }
        Ok(ExtensionData::AuthorityKeyIdentifier {
            key_id,
            issuer,
            serial,
        })
    }
}

fn split_sequence(data: &[u8]) -> Result<(&[u8], usize)> {
    let (t, constructed, id_len) = Tag::decode(data)?;
    if t != Tag::universal(asn1_tag::universal::SEQUENCE) || !constructed {
        return Err(Error::parse("expected a sequence"));
    }
    let (len, len_len) = asn1_tag::decode_length(&data[id_len..])?;
    let len = len.ok_or_else(|| Error::parse("Indefinite length not supported"))?;
    let start = id_len + len_len;
    if data.len() < start + len {
        return Err(Error::parse("Incomplete data"));
    }
    Ok((&data[start..start + len], start + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_constraints_roundtrip() {
        let ext = Extension::basic_constraints(true, true, Some(3));
        let asn1 = ext.to_asn1().expect("encode");
        let der = asn1.encode_der().expect("der");
        let parsed = Extension::from_asn1(
            &Extension::def().parse_exact(&der).expect("parse"),
        )
        .expect("from asn1");
        assert_eq!(parsed, ext);
    }

    #[test]
    fn key_usage_roundtrip() {
        let ext = Extension::key_usage(
            true,
            KeyUsageFlags::KEY_CERT_SIGN | KeyUsageFlags::DIGITAL_SIGNATURE,
        );
        let der = ext.to_asn1().expect("encode").encode_der().expect("der");
        let parsed = Extension::from_asn1(
            &Extension::def().parse_exact(&der).expect("parse"),
        )
        .expect("from asn1");
        assert_eq!(parsed, ext);
    }

    #[test]
    fn aki_roundtrip() {
        let ext = Extension::authority_key_identifier(Some(vec![1, 2, 3, 4]));
        let der = ext.to_asn1().expect("encode").encode_der().expect("der");
        let parsed = Extension::from_asn1(
            &Extension::def().parse_exact(&der).expect("parse"),
        )
        .expect("from asn1");
        assert_eq!(parsed, ext);
    }
}
