// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! RSA keys, the raw modular number transform, and the block wrapper
//! used by the channel handshake.
//!
//! Keys are immutable value objects. A key may be a half key: `e`
//! without `d` is public-only, `d` without `e` is private-only. The
//! block wrapper treats fixed-width big-endian byte blocks as numbers;
//! ciphertext blocks are one byte wider than plaintext blocks so every
//! plaintext block is guaranteed to be below the modulus.

use num_bigint_dig::{BigInt, BigUint, ModInverse, prime};
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::RngExt;

use crate::{
    crypto::block::BlockTransformer,
    error::{Error, Result},
};

/// Miller-Rabin rounds for primality checks.
const PRIME_ROUNDS: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaKey {
    n: BigUint,
    e: Option<BigUint>,
    d: Option<BigUint>,
    p: Option<BigUint>,
    q: Option<BigUint>,
}

impl RsaKey {
    /// Builds a key from raw parameters, checking the structural
    /// invariants.
    pub fn new(
        n: BigUint,
        e: Option<BigUint>,
        d: Option<BigUint>,
        p: Option<BigUint>,
        q: Option<BigUint>,
    ) -> Result<Self> {
        if e.is_none() && d.is_none() {
            return Err(Error::validation("RSA e and d cannot both be absent"));
        }
        for (name, param) in [('e', &e), ('d', &d), ('p', &p), ('q', &q)] {
            if let Some(v) = param
                && !(!v.is_zero() && *v < n)
            {
                return Err(Error::validation(format!(
                    "RSA parameter {name} out of range"
                )));
            }
        }
        if p.is_some() != q.is_some() {
            return Err(Error::validation("RSA p and q must come together"));
        }
        if let (Some(p), Some(q)) = (&p, &q)
            && p * q != n
        {
            return Err(Error::validation("RSA p*q != n"));
        }
        Ok(RsaKey { n, e, d, p, q })
    }

    pub fn from_primes(p: BigUint, q: BigUint) -> Result<Self> {
        let n = &p * &q;
        let t = (&p - 1u32) * (&q - 1u32);

        let mut e = BigUint::from(65537u32);
        // Tiny moduli can occur in tests with toy primes.
        if e >= n {
            e = &n / 2u32 + &n % 2u32;
        }
        while (&t % &e).is_zero() || !prime::probably_prime(&e, PRIME_ROUNDS) {
            e += 1u32;
        }

        let d = (&e)
            .mod_inverse(&t)
            .ok_or_else(|| Error::crypto("could not derive private exponent"))?;
        let t_int = BigInt::from(t.clone());
        let d = d
            .mod_floor(&t_int)
            .to_biguint()
            .ok_or_else(|| Error::crypto("could not derive private exponent"))?;
        if ((&d * &e) % &t) != BigUint::one() {
            return Err(Error::crypto("could not derive private exponent"));
        }
        RsaKey::new(n, Some(e), Some(d), Some(p), Some(q))
    }

    /// Generates a fresh keypair with a modulus of `bits` bits.
    pub fn generate(bits: usize) -> Result<Self> {
        if bits < 32 || bits % 16 != 0 {
            return Err(Error::validation(format!(
                "unsupported RSA key size {bits}"
            )));
        }
        loop {
            let p = random_prime(bits / 2);
            let q = random_prime(bits - bits / 2);
            if p == q {
                continue;
            }
            let n = &p * &q;
            if n.bits() != bits {
                continue;
            }
            match RsaKey::from_primes(p, q) {
                Ok(key) => return Ok(key),
                Err(_) => continue,
            }
        }
    }

    /// Public half of the key.
    pub fn public(&self) -> Result<RsaKey> {
        let e = self
            .e
            .clone()
            .ok_or_else(|| Error::validation("key has no public part"))?;
        RsaKey::new(self.n.clone(), Some(e), None, None, None)
    }

    pub fn has_public(&self) -> bool {
        self.e.is_some()
    }

    pub fn has_private(&self) -> bool {
        self.d.is_some()
    }

    pub fn modulus(&self) -> &BigUint {
        &self.n
    }

    pub fn public_exponent(&self) -> Option<&BigUint> {
        self.e.as_ref()
    }

    pub fn private_exponent(&self) -> Option<&BigUint> {
        self.d.as_ref()
    }

    pub fn primes(&self) -> Option<(&BigUint, &BigUint)> {
        match (&self.p, &self.q) {
            (Some(p), Some(q)) => Some((p, q)),
            _ => None,
        }
    }

    /// Byte length of the modulus.
    pub fn byte_len(&self) -> usize {
        self.n.bits().div_ceil(8)
    }

    /// True if the modulus is wider than `max_bytes` bytes.
    pub fn exceeds_len(&self, max_bytes: usize) -> bool {
        self.n.bits() > 8 * max_bytes
    }

    /// CRT exponent `d mod (p-1)`.
    pub fn exp1(&self) -> Result<BigUint> {
        let (p, _) = self.crt_parts()?;
        Ok(self.require_d()? % (p - 1u32))
    }

    /// CRT exponent `d mod (q-1)`.
    pub fn exp2(&self) -> Result<BigUint> {
        let (_, q) = self.crt_parts()?;
        Ok(self.require_d()? % (q - 1u32))
    }

    /// CRT coefficient `q^-1 mod p`.
    pub fn coefficient(&self) -> Result<BigUint> {
        let (p, q) = self.crt_parts()?;
        let p_int = BigInt::from(p.clone());
        let coeff = q
            .mod_inverse(p)
            .ok_or_else(|| Error::crypto("q has no inverse mod p"))?;
        coeff
            .mod_floor(&p_int)
            .to_biguint()
            .ok_or_else(|| Error::crypto("q has no inverse mod p"))
    }

    fn require_d(&self) -> Result<&BigUint> {
        self.d
            .as_ref()
            .ok_or_else(|| Error::validation("operation requires a private key"))
    }

    fn crt_parts(&self) -> Result<(&BigUint, &BigUint)> {
        self.primes()
            .ok_or_else(|| Error::validation("operation requires key primes"))
    }

    /// Number transform `m^e mod n`.
    pub fn encrypter(&self) -> Result<RsaTransform> {
        let e = self
            .e
            .clone()
            .ok_or_else(|| Error::validation("encrypt requires a public key"))?;
        Ok(RsaTransform {
            n: self.n.clone(),
            exp: e,
        })
    }

    /// Number transform `m^d mod n`.
    pub fn decrypter(&self) -> Result<RsaTransform> {
        let d = self
            .d
            .clone()
            .ok_or_else(|| Error::validation("decrypt requires a private key"))?;
        Ok(RsaTransform {
            n: self.n.clone(),
            exp: d,
        })
    }

    /// Block encrypter toward this (public) key.
    pub fn block_encrypter(&self) -> Result<RsaBlockTransform> {
        Ok(RsaBlockTransform::new(self.encrypter()?, true, self.byte_len()))
    }

    /// Block decrypter using this (private) key.
    pub fn block_decrypter(&self) -> Result<RsaBlockTransform> {
        Ok(RsaBlockTransform::new(self.decrypter()?, false, self.byte_len()))
    }
}

fn random_prime(bits: usize) -> BigUint {
    let bytes = bits.div_ceil(8);
    let mut buf = vec![0u8; bytes];
    loop {
        rand::rng().fill(buf.as_mut_slice());
        // Force full bit width and oddness.
        buf[0] |= 0xc0;
        buf[bytes - 1] |= 0x01;
        let candidate = BigUint::from_bytes_be(&buf);
        if prime::probably_prime(&candidate, PRIME_ROUNDS) {
            return candidate;
        }
    }
}

/// Raw modular exponentiation transform over numbers below the modulus.
pub struct RsaTransform {
    n: BigUint,
    exp: BigUint,
}

impl RsaTransform {
    pub fn transform_num(&self, m: &BigUint) -> Result<BigUint> {
        if *m >= self.n {
            return Err(Error::crypto("number exceeds modulus"));
        }
        Ok(m.modpow(&self.exp, &self.n))
    }

    pub fn max_number(&self) -> BigUint {
        &self.n - 1u32
    }
}

/// Treats the RSA number transform as a block transform.
///
/// Ciphertext blocks span the full modulus width; plaintext blocks are
/// one byte narrower.
pub struct RsaBlockTransform {
    inner: RsaTransform,
    encrypt: bool,
    ct_len: usize,
}

impl RsaBlockTransform {
    fn new(inner: RsaTransform, encrypt: bool, ct_len: usize) -> Self {
        RsaBlockTransform {
            inner,
            encrypt,
            ct_len,
        }
    }

    fn pt_len(&self) -> usize {
        self.ct_len - 1
    }

    fn transform_chunk(&self, chunk: &[u8], out_len: usize) -> Result<Vec<u8>> {
        let m = BigUint::from_bytes_be(chunk);
        let num = self.inner.transform_num(&m)?;
        let bytes = num.to_bytes_be();
        if bytes.len() > out_len {
            return Err(Error::crypto("transformed block exceeds block size"));
        }
        let mut padded = vec![0u8; out_len - bytes.len()];
        padded.extend_from_slice(&bytes);
        Ok(padded)
    }
}

impl BlockTransformer for RsaBlockTransform {
    fn in_blocksize(&self) -> usize {
        if self.encrypt { self.pt_len() } else { self.ct_len }
    }

    fn out_blocksize(&self) -> usize {
        if self.encrypt { self.ct_len } else { self.pt_len() }
    }

    fn transform(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let in_len = self.in_blocksize();
        let out_len = self.out_blocksize();
        if data.is_empty() || data.len() % in_len != 0 {
            return Err(Error::crypto(format!(
                "input length {} is not a whole number of blocks",
                data.len()
            )));
        }
        let mut out = Vec::with_capacity(data.len() / in_len * out_len);
        for chunk in data.chunks_exact(in_len) {
            out.extend_from_slice(&self.transform_chunk(chunk, out_len)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_primes_roundtrips_numbers() {
        let p = BigUint::from(61681u32);
        let q = BigUint::from(65521u32);
        let key = RsaKey::from_primes(p, q).expect("key");
        let enc = key.encrypter().expect("encrypter");
        let dec = key.decrypter().expect("decrypter");
        let m = BigUint::from(123456789u32);
        let c = enc.transform_num(&m).expect("encrypt");
        assert_eq!(dec.transform_num(&c).expect("decrypt"), m);
    }

    #[test]
    fn block_transform_roundtrip() {
        let key = RsaKey::generate(512).expect("keypair");
        let mut enc = key.block_encrypter().expect("encrypter");
        let mut dec = key.block_decrypter().expect("decrypter");
        let pt = vec![0xabu8; enc.in_blocksize() * 3];
        let ct = enc.transform(&pt).expect("encrypt");
        assert_eq!(ct.len(), enc.out_blocksize() * 3);
        assert_eq!(dec.transform(&ct).expect("decrypt"), pt);
    }

    #[test]
    fn half_keys_are_limited() {
        let key = RsaKey::generate(512).expect("keypair");
        let public = key.public().expect("public half");
        assert!(public.has_public());
        assert!(!public.has_private());
        assert!(public.decrypter().is_err());
    }
}
