// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! X.509 / PKCS object model: names, extensions, certificates,
//! certification requests, key import/export and RSASSA signatures.

pub mod cert;
pub mod csr;
pub mod ext;
pub mod keys;
pub mod name;
pub mod sign;

use once_cell::sync::Lazy;

use crate::asn1::Oid;

/// Export/import encodings for keys, certificates and requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum X509Format {
    Der,
    Pem,
}

pub static SHA1_WITH_RSA_OID: Lazy<Oid> =
    Lazy::new(|| Oid::new(&[1, 2, 840, 113549, 1, 1, 5]));
pub static RSA_ENCRYPTION_OID: Lazy<Oid> =
    Lazy::new(|| Oid::new(&[1, 2, 840, 113549, 1, 1, 1]));
pub static SHA1_OID: Lazy<Oid> = Lazy::new(|| Oid::new(&[1, 3, 14, 3, 2, 26]));

pub static BASIC_CONSTRAINTS_OID: Lazy<Oid> =
    Lazy::new(|| Oid::new(&[2, 5, 29, 19]));
pub static SUBJECT_KEY_ID_OID: Lazy<Oid> = Lazy::new(|| Oid::new(&[2, 5, 29, 14]));
pub static KEY_USAGE_OID: Lazy<Oid> = Lazy::new(|| Oid::new(&[2, 5, 29, 15]));
pub static AUTHORITY_KEY_ID_OID: Lazy<Oid> =
    Lazy::new(|| Oid::new(&[2, 5, 29, 35]));
