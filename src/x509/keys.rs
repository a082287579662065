// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! RSA key export/import in PKCS#1 and SubjectPublicKeyInfo forms,
//! with optional PEM wrapping.

use num_bigint_dig::{BigInt, BigUint};
use num_traits::{Signed, Zero};

use crate::{
    asn1::{BitString, Def, SequenceDef, Value, value::Constructed},
    crypto::rsa::RsaKey,
    error::{Error, Result},
    x509::{RSA_ENCRYPTION_OID, X509Format},
};

pub const PEM_RSA_PUBLIC: &str = "RSA PUBLIC KEY";
pub const PEM_RSA_PRIVATE: &str = "RSA PRIVATE KEY";
pub const PEM_PUBLIC: &str = "PUBLIC KEY";
pub const PEM_CERTIFICATE: &str = "CERTIFICATE";
pub const PEM_CERT_REQUEST: &str = "CERTIFICATE REQUEST";

fn uint(value: &BigUint) -> Value {
    Value::Integer(BigInt::from(value.clone()))
}

fn get_uint(seq: &Constructed, name: &str) -> Result<BigUint> {
    let n = seq
        .get(name)
        .and_then(Value::as_integer)
        .ok_or_else(|| Error::parse(format!("missing integer field {name}")))?;
    if n.is_negative() {
        return Err(Error::parse(format!("negative integer field {name}")));
    }
    n.to_biguint()
        .ok_or_else(|| Error::parse(format!("bad integer field {name}")))
}

/// PKCS#1 `RSAPublicKey` DER: `SEQUENCE { n, e }`.
pub fn public_key_der(key: &RsaKey) -> Result<Vec<u8>> {
    let e = key
        .public_exponent()
        .ok_or_else(|| Error::validation("key has no public part"))?;
    let mut seq = Constructed::new();
    seq.push_named(uint(key.modulus()), "modulus");
    seq.push_named(uint(e), "publicExponent");
    Value::Sequence(seq).encode_der()
}

fn rsa_public_key_def() -> Def {
    Def::sequence(
        SequenceDef::new()
            .field(Def::Integer, "modulus")
            .field(Def::Integer, "publicExponent"),
    )
}

pub fn import_public_key_der(data: &[u8]) -> Result<RsaKey> {
    let value = rsa_public_key_def().parse_exact(data)?;
    let seq = value
        .as_constructed()
        .ok_or_else(|| Error::parse("bad RSAPublicKey"))?;
    RsaKey::new(
        get_uint(seq, "modulus")?,
        Some(get_uint(seq, "publicExponent")?),
        None,
        None,
        None,
    )
}

/// PKCS#1 `RSAPrivateKey` DER with the CRT parameters.
pub fn private_key_der(key: &RsaKey) -> Result<Vec<u8>> {
    let e = key
        .public_exponent()
        .ok_or_else(|| Error::validation("export requires a full keypair"))?;
    let d = key
        .private_exponent()
        .ok_or_else(|| Error::validation("export requires a full keypair"))?;
    let (p, q) = key
        .primes()
        .ok_or_else(|| Error::validation("export requires key primes"))?;

    let mut seq = Constructed::new();
    seq.push_named(Value::integer(0), "version");
    seq.push_named(uint(key.modulus()), "modulus");
    seq.push_named(uint(e), "publicExponent");
    seq.push_named(uint(d), "privateExponent");
    seq.push_named(uint(p), "prime1");
    seq.push_named(uint(q), "prime2");
    seq.push_named(uint(&key.exp1()?), "exponent1");
    seq.push_named(uint(&key.exp2()?), "exponent2");
    seq.push_named(uint(&key.coefficient()?), "coefficient");
    Value::Sequence(seq).encode_der()
}

fn rsa_private_key_def() -> Def {
    Def::sequence(
        SequenceDef::new()
            .field(Def::Integer, "version")
            .field(Def::Integer, "modulus")
            .field(Def::Integer, "publicExponent")
            .field(Def::Integer, "privateExponent")
            .field(Def::Integer, "prime1")
            .field(Def::Integer, "prime2")
            .field(Def::Integer, "exponent1")
            .field(Def::Integer, "exponent2")
            .field(Def::Integer, "coefficient"),
    )
}

pub fn import_private_key_der(data: &[u8]) -> Result<RsaKey> {
    let value = rsa_private_key_def().parse_exact(data)?;
    let seq = value
        .as_constructed()
        .ok_or_else(|| Error::parse("bad RSAPrivateKey"))?;
    let version = seq
        .get("version")
        .and_then(Value::as_integer)
        .ok_or_else(|| Error::parse("bad RSAPrivateKey"))?;
    if !version.is_zero() {
        return Err(Error::parse("unsupported RSAPrivateKey version"));
    }
    RsaKey::new(
        get_uint(seq, "modulus")?,
        Some(get_uint(seq, "publicExponent")?),
        Some(get_uint(seq, "privateExponent")?),
        Some(get_uint(seq, "prime1")?),
        Some(get_uint(seq, "prime2")?),
    )
}

/// AlgorithmIdentifier SEQUENCE for rsaEncryption with NULL parameters.
pub fn rsa_algorithm_identifier() -> Value {
    let mut alg = Constructed::new();
    alg.push_named(
        Value::ObjectIdentifier(RSA_ENCRYPTION_OID.clone()),
        "algorithm",
    );
    alg.push_named(Value::Null, "parameters");
    Value::Sequence(alg)
}

pub fn algorithm_identifier_def() -> Def {
    Def::sequence(
        SequenceDef::new()
            .field(Def::ObjectIdentifier, "algorithm")
            .optional(Def::Any { allow_unknown: true }, "parameters"),
    )
}

/// SubjectPublicKeyInfo wrapping the PKCS#1 public key in a BIT STRING.
pub fn spki_der(key: &RsaKey) -> Result<Vec<u8>> {
    spki_value(key)?.encode_der()
}

pub fn spki_value(key: &RsaKey) -> Result<Value> {
    let mut seq = Constructed::new();
    seq.push_named(rsa_algorithm_identifier(), "algorithm");
    seq.push_named(
        Value::BitString(BitString::from_octets(public_key_der(key)?)),
        "subjectPublicKey",
    );
    Ok(Value::Sequence(seq))
}

pub fn spki_def() -> Def {
    Def::sequence(
        SequenceDef::new()
            .field(algorithm_identifier_def(), "algorithm")
            .field(Def::BitString, "subjectPublicKey"),
    )
}

/// Pulls the RSA key out of a parsed SubjectPublicKeyInfo value.
pub fn key_from_spki(value: &Value) -> Result<RsaKey> {
    let seq = value
        .as_constructed()
        .ok_or_else(|| Error::parse("bad SubjectPublicKeyInfo"))?;
    let alg = seq
        .get("algorithm")
        .and_then(Value::as_constructed)
        .ok_or_else(|| Error::parse("bad SubjectPublicKeyInfo"))?;
    let oid = alg
        .get("algorithm")
        .and_then(Value::as_oid)
        .ok_or_else(|| Error::parse("bad SubjectPublicKeyInfo"))?;
    if *oid != *RSA_ENCRYPTION_OID {
        return Err(Error::parse(format!("unsupported key algorithm {oid}")));
    }
    let bits = seq
        .get("subjectPublicKey")
        .and_then(Value::as_bit_string)
        .ok_or_else(|| Error::parse("bad SubjectPublicKeyInfo"))?;
    if bits.unused != 0 {
        return Err(Error::parse("bad SubjectPublicKeyInfo"));
    }
    import_public_key_der(&bits.data)
}

pub fn import_spki_der(data: &[u8]) -> Result<RsaKey> {
    key_from_spki(&spki_def().parse_exact(data)?)
}

/// Wraps DER in a `-----BEGIN name-----` PEM block.
pub fn encode_pem_block(name: &str, der: &[u8]) -> Vec<u8> {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    let b64 = STANDARD.encode(der);
    let mut out = format!("-----BEGIN {name}-----\n");
    for chunk in b64.as_bytes().chunks(64) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push_str(&format!("-----END {name}-----\n"));
    out.into_bytes()
}

/// Decodes a PEM block, returning `(block name, DER payload)`.
pub fn decode_pem_block(data: &[u8]) -> Result<(String, Vec<u8>)> {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    let text = std::str::from_utf8(data)
        .map_err(|_| Error::parse("PEM block is not ASCII"))?;
    let mut name = None;
    let mut body = String::new();
    let mut seen_end = false;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("-----BEGIN ") {
            let header = rest
                .strip_suffix("-----")
                .ok_or_else(|| Error::parse("malformed PEM header"))?;
            name = Some(header.to_string());
        } else if let Some(rest) = line.strip_prefix("-----END ") {
            let footer = rest
                .strip_suffix("-----")
                .ok_or_else(|| Error::parse("malformed PEM footer"))?;
            if name.as_deref() != Some(footer) {
                return Err(Error::parse("Block header and ending do not match"));
            }
            seen_end = true;
            break;
        } else if name.is_some() {
            body.push_str(line);
        }
    }
    let name = name.ok_or_else(|| Error::parse("no PEM block found"))?;
    if !seen_end {
        return Err(Error::parse("Block header and ending do not match"));
    }
    let der = STANDARD
        .decode(body.as_bytes())
        .map_err(|_| Error::parse("invalid base64 in PEM block"))?;
    Ok((name, der))
}

pub fn export_public_key(key: &RsaKey, fmt: X509Format) -> Result<Vec<u8>> {
    let der = public_key_der(key)?;
    Ok(match fmt {
        X509Format::Der => der,
        X509Format::Pem => encode_pem_block(PEM_RSA_PUBLIC, &der),
    })
}

pub fn import_public_key(data: &[u8], fmt: X509Format) -> Result<RsaKey> {
    match fmt {
        X509Format::Der => import_public_key_der(data),
        X509Format::Pem => {
            let (name, der) = decode_pem_block(data)?;
            if name != PEM_RSA_PUBLIC {
                return Err(Error::parse(format!("unexpected PEM block {name}")));
            }
            import_public_key_der(&der)
        },
    }
}

pub fn export_private_key(key: &RsaKey, fmt: X509Format) -> Result<Vec<u8>> {
    let der = private_key_der(key)?;
    Ok(match fmt {
        X509Format::Der => der,
        X509Format::Pem => encode_pem_block(PEM_RSA_PRIVATE, &der),
    })
}

pub fn import_private_key(data: &[u8], fmt: X509Format) -> Result<RsaKey> {
    match fmt {
        X509Format::Der => import_private_key_der(data),
        X509Format::Pem => {
            let (name, der) = decode_pem_block(data)?;
            if name != PEM_RSA_PRIVATE {
                return Err(Error::parse(format!("unexpected PEM block {name}")));
            }
            import_private_key_der(&der)
        },
    }
}

pub fn export_spki_public_key(key: &RsaKey, fmt: X509Format) -> Result<Vec<u8>> {
    let der = spki_der(key)?;
    Ok(match fmt {
        X509Format::Der => der,
        X509Format::Pem => encode_pem_block(PEM_PUBLIC, &der),
    })
}

pub fn import_spki_public_key(data: &[u8], fmt: X509Format) -> Result<RsaKey> {
    match fmt {
        X509Format::Der => import_spki_der(data),
        X509Format::Pem => {
            let (name, der) = decode_pem_block(data)?;
            if name != PEM_PUBLIC {
                return Err(Error::parse(format!("unexpected PEM block {name}")));
            }
            import_spki_der(&der)
        },
    }
}
