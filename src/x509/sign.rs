// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! EMSA-PKCS1-v1_5 encoding and RSASSA signatures.

use num_bigint_dig::BigUint;

use crate::{
    asn1::{Value, value::Constructed},
    crypto::{hashes::HashKind, rsa::RsaKey},
    error::{Error, Result},
};

/// DER DigestInfo: `SEQUENCE { AlgorithmIdentifier, OCTET STRING }`.
fn digest_info(hash: HashKind, digest: &[u8]) -> Result<Vec<u8>> {
    let mut alg = Constructed::new();
    alg.push_named(Value::ObjectIdentifier(hash.oid()), "algorithm");
    alg.push_named(Value::Null, "parameters");
    let mut seq = Constructed::new();
    seq.push_named(Value::Sequence(alg), "digestAlgorithm");
    seq.push_named(Value::OctetString(digest.to_vec()), "digest");
    Value::Sequence(seq).encode_der()
}

/// EMSA-PKCS1-v1_5: `00 01 PS 00 T` padded to `enc_len` with at least
/// eight `0xFF` bytes of PS.
pub fn emsa_pkcs1_v1_5_encode(
    msg: &[u8],
    enc_len: usize,
    hash: HashKind,
) -> Result<Vec<u8>> {
    let t = digest_info(hash, &hash.digest(msg))?;
    if enc_len < t.len() + 11 {
        return Err(Error::crypto("intended encoded message length too short"));
    }
    let mut out = Vec::with_capacity(enc_len);
    out.push(0x00);
    out.push(0x01);
    out.resize(enc_len - t.len() - 1, 0xff);
    out.push(0x00);
    out.extend_from_slice(&t);
    Ok(out)
}

/// RSASSA-PKCS1-v1_5 signature: private transform of the encoded block,
/// emitted at full modulus width.
pub fn rsassa_pkcs1_v1_5_sign(
    key: &RsaKey,
    hash: HashKind,
    msg: &[u8],
) -> Result<Vec<u8>> {
    let k = key.byte_len();
    let em = emsa_pkcs1_v1_5_encode(msg, k, hash)?;
    let m = BigUint::from_bytes_be(&em);
    let s = key.decrypter()?.transform_num(&m)?;
    let bytes = s.to_bytes_be();
    let mut out = vec![0u8; k - bytes.len()];
    out.extend_from_slice(&bytes);
    Ok(out)
}

/// Verifies by applying the public transform and comparing byte-wise
/// against a fresh encoding of the message.
pub fn rsassa_pkcs1_v1_5_verify(
    key: &RsaKey,
    hash: HashKind,
    msg: &[u8],
    sig: &[u8],
) -> bool {
    let k = key.byte_len();
    if sig.len() != k {
        return false;
    }
    let Ok(encrypter) = key.encrypter() else {
        return false;
    };
    let s = BigUint::from_bytes_be(sig);
    let Ok(m) = encrypter.transform_num(&s) else {
        return false;
    };
    let bytes = m.to_bytes_be();
    if bytes.len() > k {
        return false;
    }
    let mut orig = vec![0u8; k - bytes.len()];
    orig.extend_from_slice(&bytes);
    match emsa_pkcs1_v1_5_encode(msg, k, hash) {
        Ok(em) => em == orig,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    #[test]
    fn emsa_sha1_shape_for_empty_message() {
        let em = emsa_pkcs1_v1_5_encode(b"", 128, HashKind::Sha1).expect("encode");
        assert_eq!(em.len(), 128);
        assert_eq!(&em[..2], &[0x00, 0x01]);
        // DigestInfo prefix for SHA-1 plus SHA-1 of the empty string.
        let tail = hex!(
            "003021300906052b0e03021a05000414"
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
        assert_eq!(&em[128 - tail.len()..], &tail);
        let ps = &em[2..128 - tail.len()];
        assert!(ps.len() >= 8);
        assert!(ps.iter().all(|b| *b == 0xff));
    }

    #[test]
    fn sign_verify_and_tamper() {
        let key = RsaKey::generate(768).expect("keypair");
        let msg = b"signed payload";
        let sig = rsassa_pkcs1_v1_5_sign(&key, HashKind::Sha1, msg).expect("sign");
        assert_eq!(sig.len(), key.byte_len());
        let public = key.public().expect("public");
        assert!(rsassa_pkcs1_v1_5_verify(&public, HashKind::Sha1, msg, &sig));

        let mut bad_msg = msg.to_vec();
        bad_msg[0] ^= 1;
        assert!(!rsassa_pkcs1_v1_5_verify(
            &public,
            HashKind::Sha1,
            &bad_msg,
            &sig
        ));

        let mut bad_sig = sig.clone();
        bad_sig[10] ^= 1;
        assert!(!rsassa_pkcs1_v1_5_verify(
            &public,
            HashKind::Sha1,
            msg,
            &bad_sig
        ));
    }
}
