// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed handshake messages and the handshake crypto helpers.
//!
//! Wire order: both sides send the protocol hello line, the client
//! sends ClientHello, the server answers ServerHello, the client sends
//! ClientKeyX, and the server optionally finishes with an
//! asymmetrically encrypted server secret. All payloads travel as
//! self-delimiting handshake values.

use num_bigint_dig::BigUint;

use crate::{
    codec::hsvalue::HsValue,
    crypto::{
        block::{CipherAlgo, CipherMode},
        hashes::HashKind,
        message::{MessageDecrypter, MessageEncrypter, PadGenerator},
        prf::HmacPrf,
        rsa::RsaKey,
    },
    error::{Error, Result},
    io::buf::ByteBuf,
};

/// First bytes on the wire, both directions.
pub const PROTO_HELLO: &[u8] = b"VTS_DRAFT-0.8\n";

/// A peer must terminate its hello line within this many bytes.
pub const PROTO_MAXLEN: usize = 32;

/// Minimum length of every handshake random field.
pub const MIN_RAND_LEN: usize = 32;

const SENDKEY_LABEL: &[u8] = b"vts client sendkey";
const EXPANSION_LABEL: &[u8] = b"vts key expansion";

/// Validates a complete hello line (terminator included).
pub fn check_hello(line: &[u8]) -> Result<()> {
    let Some(body) = line.strip_suffix(b"\n") else {
        return Err(Error::protocol("protocol hello not terminated"));
    };
    let mut parts = body.splitn(2, |b| *b == b'-');
    let name = parts.next().unwrap_or_default();
    let Some(version) = parts.next() else {
        return Err(Error::protocol("malformed protocol hello"));
    };
    if name != b"VTS_DRAFT" {
        return Err(Error::protocol("requires protocol VTS"));
    }
    if version.is_empty()
        || !version
            .iter()
            .all(|b| b.is_ascii_digit() || *b == b'.')
    {
        return Err(Error::protocol("illegal protocol version number"));
    }
    let numbers: Vec<&[u8]> = version.split(|b| *b == b'.').collect();
    if numbers != [b"0".as_slice(), b"8".as_slice()] {
        return Err(Error::protocol(format!(
            "protocol version {} not supported",
            String::from_utf8_lossy(version)
        )));
    }
    Ok(())
}

/// Public key data as exchanged on the wire: cipher name plus the
/// five-field key tuple with the private members absent.
#[derive(Debug, Clone, PartialEq)]
pub struct PubKeyData {
    pub cipher_name: String,
    pub n: BigUint,
    pub e: BigUint,
}

impl PubKeyData {
    pub fn from_key(key: &RsaKey) -> Result<PubKeyData> {
        let e = key
            .public_exponent()
            .ok_or_else(|| Error::validation("key has no public part"))?;
        Ok(PubKeyData {
            cipher_name: "rsa".to_string(),
            n: key.modulus().clone(),
            e: e.clone(),
        })
    }

    pub fn to_value(&self) -> HsValue {
        HsValue::Tuple(vec![
            HsValue::str(self.cipher_name.clone()),
            HsValue::Tuple(vec![
                HsValue::int(self.n.clone()),
                HsValue::int(self.e.clone()),
                HsValue::Null,
                HsValue::Null,
                HsValue::Null,
            ]),
        ])
    }

    pub fn from_value(value: &HsValue) -> Result<PubKeyData> {
        let items = value
            .as_tuple()
            .filter(|t| t.len() == 2)
            .ok_or_else(|| Error::protocol("illegal public key data"))?;
        let cipher_name = items[0]
            .as_str()
            .ok_or_else(|| Error::protocol("invalid public key cipher name"))?
            .to_string();
        let numbers = items[1]
            .as_tuple()
            .filter(|t| t.len() == 5)
            .ok_or_else(|| Error::protocol("illegal public key data"))?;
        let uint = |v: &HsValue| -> Result<BigUint> {
            v.as_int()
                .and_then(|n| n.to_biguint())
                .ok_or_else(|| Error::protocol("illegal public key data"))
        };
        let n = uint(&numbers[0])?;
        let e = uint(&numbers[1])?;
        Ok(PubKeyData { cipher_name, n, e })
    }

    pub fn into_key(self) -> Result<RsaKey> {
        RsaKey::new(self.n, Some(self.e), None, None, None)
            .map_err(|_| Error::protocol("could not initialize peer public key"))
    }
}

/// Identity-only or certificate-chain credentials.
#[derive(Debug, Clone, PartialEq)]
pub enum Credentials {
    /// DER of an X.501 Name; conveys identity without proof.
    Identity(Vec<u8>),
    /// Certificate chain DERs, leaf first.
    CertChain(Vec<Vec<u8>>),
}

impl Credentials {
    pub fn to_value(creds: &Option<Credentials>) -> HsValue {
        match creds {
            None => HsValue::Null,
            Some(Credentials::Identity(der)) => HsValue::Tuple(vec![
                HsValue::Bool(false),
                HsValue::bytes(der.clone()),
            ]),
            Some(Credentials::CertChain(ders)) => HsValue::Tuple(vec![
                HsValue::Bool(true),
                HsValue::Tuple(
                    ders.iter().map(|d| HsValue::bytes(d.clone())).collect(),
                ),
            ]),
        }
    }

    pub fn from_value(value: &HsValue) -> Result<Option<Credentials>> {
        if value.is_null() {
            return Ok(None);
        }
        let items = value
            .as_tuple()
            .filter(|t| t.len() == 2)
            .ok_or_else(|| Error::protocol("illegal credentials data"))?;
        let HsValue::Bool(is_cert) = items[0] else {
            return Err(Error::protocol("illegal credentials data"));
        };
        if is_cert {
            let ders = items[1]
                .as_tuple()
                .filter(|t| !t.is_empty())
                .ok_or_else(|| Error::protocol("illegal certificate list"))?;
            let mut out = Vec::with_capacity(ders.len());
            for der in ders {
                out.push(
                    der.as_bytes()
                        .ok_or_else(|| Error::protocol("illegal certificate"))?
                        .to_vec(),
                );
            }
            Ok(Some(Credentials::CertChain(out)))
        } else {
            let der = items[1]
                .as_bytes()
                .ok_or_else(|| Error::protocol("illegal identity data"))?;
            Ok(Some(Credentials::Identity(der.to_vec())))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientHello {
    pub hmac_hashes: Vec<String>,
    pub ciphers: Vec<(String, Vec<String>)>,
    pub hashes: Vec<String>,
    pub rand: Vec<u8>,
    pub max_keylen: Option<u64>,
    pub hshake_lim: Option<u64>,
}

impl ClientHello {
    pub fn to_value(&self) -> HsValue {
        HsValue::Tuple(vec![
            HsValue::Tuple(
                self.hmac_hashes.iter().map(|s| HsValue::str(s.as_str())).collect(),
            ),
            HsValue::Tuple(
                self.ciphers
                    .iter()
                    .map(|(name, modes)| {
                        HsValue::Tuple(vec![
                            HsValue::str(name.as_str()),
                            HsValue::Tuple(
                                modes
                                    .iter()
                                    .map(|m| HsValue::str(m.as_str()))
                                    .collect(),
                            ),
                        ])
                    })
                    .collect(),
            ),
            HsValue::Tuple(
                self.hashes.iter().map(|s| HsValue::str(s.as_str())).collect(),
            ),
            HsValue::bytes(self.rand.clone()),
            HsValue::opt_int(self.max_keylen),
            HsValue::opt_int(self.hshake_lim),
        ])
    }

    pub fn from_value(value: &HsValue) -> Result<ClientHello> {
        let items = value
            .as_tuple()
            .filter(|t| t.len() == 6)
            .ok_or_else(|| Error::protocol("could not unpack client hello"))?;
        let strings = |v: &HsValue, what: &str| -> Result<Vec<String>> {
            let t = v
                .as_tuple()
                .ok_or_else(|| Error::protocol(format!("illegal {what} list")))?;
            t.iter()
                .map(|s| {
                    s.as_str().map(str::to_string).ok_or_else(|| {
                        Error::protocol(format!("illegal {what} list"))
                    })
                })
                .collect()
        };
        let hmac_hashes = strings(&items[0], "handshake hash")?;
        let cipher_items = items[1]
            .as_tuple()
            .ok_or_else(|| Error::protocol("illegal ciphers list"))?;
        let mut ciphers = Vec::with_capacity(cipher_items.len());
        for item in cipher_items {
            let pair = item
                .as_tuple()
                .filter(|t| t.len() == 2)
                .ok_or_else(|| Error::protocol("illegal ciphers list"))?;
            let name = pair[0]
                .as_str()
                .ok_or_else(|| Error::protocol("illegal ciphers list"))?;
            let modes = strings(&pair[1], "cipher mode")?;
            ciphers.push((name.to_string(), modes));
        }
        let hashes = strings(&items[2], "hash")?;
        let rand = items[3]
            .as_bytes()
            .ok_or_else(|| Error::protocol("illegal client hello"))?
            .to_vec();
        if rand.len() < MIN_RAND_LEN {
            return Err(Error::protocol("minimum 32 bytes random data required"));
        }
        Ok(ClientHello {
            hmac_hashes,
            ciphers,
            hashes,
            rand,
            max_keylen: items[4].as_opt_positive("peer max key length")?,
            hshake_lim: items[5].as_opt_positive("peer handshake limit")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerHello {
    pub hmac_name: String,
    pub cipher_name: String,
    pub cipher_mode: String,
    pub hash_name: String,
    pub rand: Vec<u8>,
    pub keydata: PubKeyData,
    pub credentials: Option<Credentials>,
    pub max_keylen: Option<u64>,
    pub hshake_lim: Option<u64>,
}

impl ServerHello {
    pub fn to_value(&self) -> HsValue {
        HsValue::Tuple(vec![
            HsValue::str(self.hmac_name.clone()),
            HsValue::str(self.cipher_name.clone()),
            HsValue::str(self.cipher_mode.clone()),
            HsValue::str(self.hash_name.clone()),
            HsValue::bytes(self.rand.clone()),
            self.keydata.to_value(),
            Credentials::to_value(&self.credentials),
            HsValue::opt_int(self.max_keylen),
            HsValue::opt_int(self.hshake_lim),
        ])
    }

    pub fn from_value(value: &HsValue) -> Result<ServerHello> {
        let items = value
            .as_tuple()
            .filter(|t| t.len() == 9)
            .ok_or_else(|| Error::protocol("could not unpack server hello"))?;
        let text = |v: &HsValue| -> Result<String> {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::protocol("illegal server hello"))
        };
        let rand = items[4]
            .as_bytes()
            .ok_or_else(|| Error::protocol("illegal server hello"))?
            .to_vec();
        if rand.len() < MIN_RAND_LEN {
            return Err(Error::protocol("minimum 32 bytes random data required"));
        }
        Ok(ServerHello {
            hmac_name: text(&items[0])?,
            cipher_name: text(&items[1])?,
            cipher_mode: text(&items[2])?,
            hash_name: text(&items[3])?,
            rand,
            keydata: PubKeyData::from_value(&items[5])?,
            credentials: Credentials::from_value(&items[6])?,
            max_keylen: items[7].as_opt_positive("peer max key length")?,
            hshake_lim: items[8].as_opt_positive("peer handshake limit")?,
        })
    }
}

/// Directional key material derived by the expansion PRF.
pub struct DirectionKeys {
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
    pub mac: Vec<u8>,
}

/// Key expansion with the fixed output order: client key, server key,
/// client IV, server IV, client MAC secret, server MAC secret.
pub fn gen_keys(
    hmac_kind: HashKind,
    cipher: CipherAlgo,
    s_seed: &[u8],
    c_seed: &[u8],
) -> (DirectionKeys, DirectionKeys) {
    let mut seed = EXPANSION_LABEL.to_vec();
    seed.extend_from_slice(s_seed);
    seed.extend_from_slice(c_seed);
    let mut prf = HmacPrf::new(hmac_kind, b"", &seed);
    let c_key = prf.take(cipher.key_len());
    let s_key = prf.take(cipher.key_len());
    let c_iv = prf.take(cipher.block_len());
    let s_iv = prf.take(cipher.block_len());
    let c_mac = prf.take(cipher.block_len());
    let s_mac = prf.take(cipher.block_len());
    (
        DirectionKeys {
            key: c_key,
            iv: c_iv,
            mac: c_mac,
        },
        DirectionKeys {
            key: s_key,
            iv: s_iv,
            mac: s_mac,
        },
    )
}

/// Keyseed for the ClientKeyX body cipher.
pub fn sendkey_seed(block_rand: &[u8], srand_c: &[u8]) -> Vec<u8> {
    let mut seed = SENDKEY_LABEL.to_vec();
    seed.extend_from_slice(block_rand);
    seed.extend_from_slice(srand_c);
    seed
}

/// Encrypts a handshake value with a key/IV drawn from a PRF over
/// `keyseed`. The frame MAC runs with an empty secret; authenticity
/// comes from the asymmetrically protected header hash.
pub fn blockcipher_enc_value(
    value: &HsValue,
    keyseed: &[u8],
    hmac_kind: HashKind,
    cipher: (CipherAlgo, CipherMode),
    hash: HashKind,
    padder: PadGenerator,
) -> Result<Vec<u8>> {
    let mut prf = HmacPrf::new(hmac_kind, b"", keyseed);
    let key = cipher.0.generate_key(&mut prf);
    let iv = prf.take(cipher.0.block_len());
    let transform = cipher.0.encrypter(&key, &iv, cipher.1)?;
    let mut enc =
        MessageEncrypter::new(Box::new(transform), hash, Vec::new(), padder);
    enc.message(&value.encode())
}

/// Inverse of [`blockcipher_enc_value`].
pub fn blockcipher_dec_value(
    data: &[u8],
    keyseed: &[u8],
    hmac_kind: HashKind,
    cipher: (CipherAlgo, CipherMode),
    hash: HashKind,
) -> Result<HsValue> {
    let mut prf = HmacPrf::new(hmac_kind, b"", keyseed);
    let key = cipher.0.generate_key(&mut prf);
    let iv = prf.take(cipher.0.block_len());
    let transform = cipher.0.decrypter(&key, &iv, cipher.1)?;
    let mut dec = MessageDecrypter::new(Box::new(transform), hash, Vec::new());
    decrypt_value(&mut dec, data)
}

/// Asymmetric encryption of a handshake value toward a public key.
pub fn asymm_enc_value(
    value: &HsValue,
    public_key: &RsaKey,
    hash: HashKind,
    padder: PadGenerator,
) -> Result<Vec<u8>> {
    let transform = public_key.block_encrypter()?;
    let mut enc =
        MessageEncrypter::new(Box::new(transform), hash, Vec::new(), padder);
    enc.message(&value.encode())
}

/// Inverse of [`asymm_enc_value`] using the private key.
pub fn asymm_dec_value(
    data: &[u8],
    keypair: &RsaKey,
    hash: HashKind,
) -> Result<HsValue> {
    let transform = keypair.block_decrypter()?;
    let mut dec = MessageDecrypter::new(Box::new(transform), hash, Vec::new());
    decrypt_value(&mut dec, data)
}

fn decrypt_value(dec: &mut MessageDecrypter, data: &[u8]) -> Result<HsValue> {
    let buf = ByteBuf::from_slice(data);
    let num_read = dec.read(&buf)?;
    if num_read != data.len() || !dec.done()? {
        return Err(Error::crypto("data did not decrypt cleanly"));
    }
    let plain = dec.result()?.to_vec();
    parse_value_exact(&plain)
}

/// Parses exactly one handshake value covering the whole input.
pub fn parse_value_exact(data: &[u8]) -> Result<HsValue> {
    let buf = ByteBuf::from_slice(data);
    let mut reader = crate::codec::hsvalue::HsReader::new(None);
    if !reader.read(&buf)? || !buf.is_empty() {
        return Err(Error::crypto("data did not decode as a handshake value"));
    }
    reader.result()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_line_checks() {
        assert!(check_hello(b"VTS_DRAFT-0.8\n").is_ok());
        assert!(check_hello(b"VTS_DRAFT-0.9\n").is_err());
        assert!(check_hello(b"TLS_DRAFT-0.8\n").is_err());
        assert!(check_hello(b"VTS_DRAFT-0.8").is_err());
        assert!(check_hello(b"VTS_DRAFT-0.8a\n").is_err());
    }

    #[test]
    fn client_hello_roundtrip() {
        let hello = ClientHello {
            hmac_hashes: vec!["sha256".into()],
            ciphers: vec![
                ("aes256".into(), vec!["cbc".into(), "ofb".into()]),
                ("aes128".into(), vec!["cbc".into()]),
            ],
            hashes: vec!["sha1".into()],
            rand: vec![7u8; 32],
            max_keylen: Some(512),
            hshake_lim: Some(16384),
        };
        let back = ClientHello::from_value(&hello.to_value()).expect("parse");
        assert_eq!(back, hello);
    }

    #[test]
    fn server_hello_roundtrip() {
        let key = RsaKey::generate(512).expect("keypair");
        let hello = ServerHello {
            hmac_name: "sha256".into(),
            cipher_name: "aes256".into(),
            cipher_mode: "cbc".into(),
            hash_name: "sha1".into(),
            rand: vec![9u8; 48],
            keydata: PubKeyData::from_key(&key).expect("keydata"),
            credentials: Some(Credentials::Identity(vec![0x30, 0x00])),
            max_keylen: None,
            hshake_lim: Some(16384),
        };
        let back = ServerHello::from_value(&hello.to_value()).expect("parse");
        assert_eq!(back, hello);
    }

    #[test]
    fn sym_handshake_encryption_roundtrip() {
        let value = HsValue::Tuple(vec![
            HsValue::Null,
            HsValue::bytes(vec![1u8, 2, 3]),
        ]);
        let seed = sendkey_seed(&[0x55; 32], &[0x66; 32]);
        let wire = blockcipher_enc_value(
            &value,
            &seed,
            HashKind::Sha256,
            (CipherAlgo::Aes256, CipherMode::Cbc),
            HashKind::Sha1,
            PadGenerator::Zero,
        )
        .expect("encrypt");
        let back = blockcipher_dec_value(
            &wire,
            &seed,
            HashKind::Sha256,
            (CipherAlgo::Aes256, CipherMode::Cbc),
            HashKind::Sha1,
        )
        .expect("decrypt");
        assert_eq!(back, value);
    }

    #[test]
    fn asymm_handshake_encryption_roundtrip() {
        let key = RsaKey::generate(512).expect("keypair");
        let value = HsValue::bytes(vec![0xaa; 32]);
        let public = key.public().expect("public");
        let wire =
            asymm_enc_value(&value, &public, HashKind::Sha1, PadGenerator::Zero)
                .expect("encrypt");
        let back = asymm_dec_value(&wire, &key, HashKind::Sha1).expect("decrypt");
        assert_eq!(back, value);
    }
}
