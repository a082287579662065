// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! X.509 certificates: TBS construction, signing, verification and
//! issuer-chain validation.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use num_bigint_dig::BigInt;
use num_traits::ToPrimitive;

use crate::{
    asn1::{
        BitString, Def, Oid, SequenceDef, Value,
        def::element_span,
        value::Constructed,
    },
    crypto::{hashes::HashKind, rsa::RsaKey},
    error::{Error, Result},
    x509::{
        SHA1_WITH_RSA_OID, X509Format,
        ext::{Extension, ExtensionData, KeyUsageFlags},
        keys,
        name::Name,
        sign,
    },
};

fn time_def() -> Def {
    Def::choice(vec![Def::UtcTime, Def::GeneralizedTime])
}

fn validity_def() -> Def {
    Def::sequence(
        SequenceDef::new()
            .field(time_def(), "notBefore")
            .field(time_def(), "notAfter"),
    )
}

fn extensions_def() -> Def {
    Def::sequence_of(Extension::def())
}

pub fn tbs_certificate_def() -> Def {
    Def::sequence(
        SequenceDef::new()
            .with_default(
                Def::explicit(0, Def::Integer),
                "version",
                Value::integer(0),
            )
            .field(Def::Integer, "serialNumber")
            .field(keys::algorithm_identifier_def(), "signature")
            .field(Name::def(), "issuer")
            .field(validity_def(), "validity")
            .field(Name::def(), "subject")
            .field(keys::spki_def(), "subjectPublicKeyInfo")
            .optional(Def::implicit(1, Def::BitString), "issuerUniqueID")
            .optional(Def::implicit(2, Def::BitString), "subjectUniqueID")
            .optional(Def::explicit(3, extensions_def()), "extensions"),
    )
}

pub fn certificate_def() -> Def {
    Def::sequence(
        SequenceDef::new()
            .field(tbs_certificate_def(), "tbsCertificate")
            .field(keys::algorithm_identifier_def(), "signatureAlgorithm")
            .field(Def::BitString, "signatureValue"),
    )
}

/// Inputs for building a to-be-signed certificate block.
#[derive(Clone)]
pub struct CertParams {
    pub serial: BigInt,
    pub issuer: Name,
    /// Defaults to five minutes before now.
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: DateTime<Utc>,
    pub subject: Name,
    pub issuer_unique_id: Option<BitString>,
    pub subject_unique_id: Option<BitString>,
    pub extensions: Vec<Extension>,
}

impl CertParams {
    pub fn new(
        serial: impl Into<BigInt>,
        issuer: Name,
        not_after: DateTime<Utc>,
        subject: Name,
    ) -> Self {
        CertParams {
            serial: serial.into(),
            issuer,
            not_before: None,
            not_after,
            subject,
            issuer_unique_id: None,
            subject_unique_id: None,
            extensions: Vec::new(),
        }
    }
}

fn truncate_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_nanosecond(0).unwrap_or(t)
}

fn time_value(t: DateTime<Utc>) -> Value {
    if (1950..2050).contains(&t.year()) {
        Value::UtcTime(t)
    } else {
        Value::GeneralizedTime(t)
    }
}

/// Options for issuer-chain validation.
#[derive(Debug, Clone, Copy)]
pub struct CertifyOpts {
    pub verify_time: bool,
    pub tstamp: Option<DateTime<Utc>>,
    pub strict: bool,
}

impl Default for CertifyOpts {
    fn default() -> Self {
        CertifyOpts {
            verify_time: true,
            tstamp: None,
            strict: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Certificate {
    version: u32,
    serial: BigInt,
    sign_alg: Oid,
    issuer: Name,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    subject: Name,
    subject_key: RsaKey,
    issuer_unique_id: Option<BitString>,
    subject_unique_id: Option<BitString>,
    extensions: Vec<Extension>,
    tbs_der: Vec<u8>,
    signature: Vec<u8>,
}

impl Certificate {
    /// Builds the TBSCertificate value. The version is autoselected:
    /// v3 with extensions, v2 with unique identifiers, v1 otherwise.
    pub fn create_tbs(params: &CertParams, subject_key: &RsaKey) -> Result<Value> {
        let version: i64 = if !params.extensions.is_empty() {
            2
        } else if params.issuer_unique_id.is_some()
            || params.subject_unique_id.is_some()
        {
            1
        } else {
            0
        };

        let not_before = truncate_seconds(
            params
                .not_before
                .unwrap_or_else(|| Utc::now() - Duration::minutes(5)),
        );
        let not_after = truncate_seconds(params.not_after);

        let mut tbs = Constructed::new();
        if version != 0 {
            tbs.push_named(
                Value::Tagged(Box::new(crate::asn1::TaggedValue {
                    tag: crate::asn1::Tag::context(0),
                    explicit: true,
                    inner: Value::integer(version),
                })),
                "version",
            );
        } else {
            tbs.push_default(Value::integer(0), Some("version".to_string()));
        }
        tbs.push_named(Value::Integer(params.serial.clone()), "serialNumber");

        let mut sig_alg = Constructed::new();
        sig_alg.push_named(
            Value::ObjectIdentifier(SHA1_WITH_RSA_OID.clone()),
            "algorithm",
        );
        sig_alg.push_named(Value::Null, "parameters");
        tbs.push_named(Value::Sequence(sig_alg), "signature");

        tbs.push_named(params.issuer.to_asn1(), "issuer");

        let mut validity = Constructed::new();
        validity.push_named(time_value(not_before), "notBefore");
        validity.push_named(time_value(not_after), "notAfter");
        tbs.push_named(Value::Sequence(validity), "validity");

        tbs.push_named(params.subject.to_asn1(), "subject");
        tbs.push_named(keys::spki_value(subject_key)?, "subjectPublicKeyInfo");

        if let Some(id) = &params.issuer_unique_id {
            tbs.push_named(
                Value::Tagged(Box::new(crate::asn1::TaggedValue {
                    tag: crate::asn1::Tag::context(1),
                    explicit: false,
                    inner: Value::BitString(id.clone()),
                })),
                "issuerUniqueID",
            );
        }
        if let Some(id) = &params.subject_unique_id {
            tbs.push_named(
                Value::Tagged(Box::new(crate::asn1::TaggedValue {
                    tag: crate::asn1::Tag::context(2),
                    explicit: false,
                    inner: Value::BitString(id.clone()),
                })),
                "subjectUniqueID",
            );
        }
        if !params.extensions.is_empty() {
            let mut exts = Constructed::new();
            for ext in &params.extensions {
                exts.push(ext.to_asn1()?);
            }
            tbs.push_named(
                Value::Tagged(Box::new(crate::asn1::TaggedValue {
                    tag: crate::asn1::Tag::context(3),
                    explicit: true,
                    inner: Value::SequenceOf(exts),
                })),
                "extensions",
            );
        }
        Ok(Value::Sequence(tbs))
    }

    /// Signs a TBS block and assembles the certificate.
    pub fn create_from_tbs(tbs: &Value, sign_key: &RsaKey) -> Result<Certificate> {
        let tbs_der = tbs.encode_der()?;
        let signature =
            sign::rsassa_pkcs1_v1_5_sign(sign_key, HashKind::Sha1, &tbs_der)?;
        Certificate::from_parts(tbs, tbs_der, signature)
    }

    /// Creates and signs a certificate in one step.
    pub fn create(
        params: &CertParams,
        subject_key: &RsaKey,
        sign_key: &RsaKey,
    ) -> Result<Certificate> {
        let tbs = Certificate::create_tbs(params, subject_key)?;
        Certificate::create_from_tbs(&tbs, sign_key)
    }

    fn from_parts(
        tbs: &Value,
        tbs_der: Vec<u8>,
        signature: Vec<u8>,
    ) -> Result<Certificate> {
        let seq = tbs
            .as_constructed()
            .ok_or_else(|| Error::parse("TBS certificate is not a sequence"))?;

        let version = match seq.get("version") {
            Some(v) => v
                .untagged()
                .as_integer()
                .and_then(BigInt::to_u32)
                .ok_or_else(|| Error::parse("bad certificate version"))?,
            None => 0,
        };
        if version > 2 {
            return Err(Error::validation("certificate version out of range"));
        }

        let serial = seq
            .get("serialNumber")
            .and_then(Value::as_integer)
            .ok_or_else(|| Error::parse("missing certificate serial"))?
            .clone();

        let sign_alg = seq
            .get("signature")
            .and_then(Value::as_constructed)
            .and_then(|alg| alg.get("algorithm"))
            .and_then(Value::as_oid)
            .ok_or_else(|| Error::parse("missing signature algorithm"))?
            .clone();

        let issuer = Name::from_asn1(
            seq.get("issuer")
                .ok_or_else(|| Error::parse("missing issuer"))?,
        )?;
        let subject = Name::from_asn1(
            seq.get("subject")
                .ok_or_else(|| Error::parse("missing subject"))?,
        )?;

        let validity = seq
            .get("validity")
            .and_then(Value::as_constructed)
            .ok_or_else(|| Error::parse("missing validity"))?;
        let not_before = *validity
            .get("notBefore")
            .map(Value::untagged)
            .and_then(Value::as_time)
            .ok_or_else(|| Error::parse("missing notBefore"))?;
        let not_after = *validity
            .get("notAfter")
            .map(Value::untagged)
            .and_then(Value::as_time)
            .ok_or_else(|| Error::parse("missing notAfter"))?;

        let subject_key = keys::key_from_spki(
            seq.get("subjectPublicKeyInfo")
                .ok_or_else(|| Error::parse("missing subject key info"))?,
        )?;

        let unique_id = |name: &str| -> Result<Option<BitString>> {
            match seq.get(name) {
                Some(v) => Ok(Some(
                    v.untagged()
                        .as_bit_string()
                        .ok_or_else(|| Error::parse("bad unique identifier"))?
                        .clone(),
                )),
                None => Ok(None),
            }
        };
        let issuer_unique_id = unique_id("issuerUniqueID")?;
        let subject_unique_id = unique_id("subjectUniqueID")?;

        let mut extensions = Vec::new();
        if let Some(wrapped) = seq.get("extensions") {
            let list = wrapped
                .untagged()
                .as_constructed()
                .ok_or_else(|| Error::parse("bad extension list"))?;
            for ext in list.values() {
                extensions.push(Extension::from_asn1(ext)?);
            }
        }

        Ok(Certificate {
            version,
            serial,
            sign_alg,
            issuer,
            not_before,
            not_after,
            subject,
            subject_key,
            issuer_unique_id,
            subject_unique_id,
            extensions,
            tbs_der,
            signature,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn serial(&self) -> &BigInt {
        &self.serial
    }

    pub fn sign_algorithm(&self) -> &Oid {
        &self.sign_alg
    }

    pub fn issuer(&self) -> &Name {
        &self.issuer
    }

    pub fn subject(&self) -> &Name {
        &self.subject
    }

    pub fn valid_not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn valid_not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn subject_key(&self) -> &RsaKey {
        &self.subject_key
    }

    pub fn issuer_unique_id(&self) -> Option<&BitString> {
        self.issuer_unique_id.as_ref()
    }

    pub fn subject_unique_id(&self) -> Option<&BitString> {
        self.subject_unique_id.as_ref()
    }

    pub fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    pub fn extension(&self, oid: &Oid) -> Option<&Extension> {
        self.extensions.iter().find(|e| e.oid == *oid)
    }

    fn subject_key_id(&self) -> Option<&[u8]> {
        self.extensions.iter().find_map(Extension::subject_key_id)
    }

    fn authority_key_id(&self) -> Option<&[u8]> {
        self.extensions.iter().find_map(Extension::authority_key_id)
    }

    /// Verifies the certificate signature against `key`; with `issuer`
    /// set, the stored issuer name must also match.
    pub fn verify_key(&self, key: &RsaKey, issuer: Option<&Name>) -> Result<bool> {
        if self.sign_alg != *SHA1_WITH_RSA_OID {
            return Err(Error::crypto("signature method not supported"));
        }
        if !sign::rsassa_pkcs1_v1_5_verify(
            key,
            HashKind::Sha1,
            &self.tbs_der,
            &self.signature,
        ) {
            return Ok(false);
        }
        match issuer {
            Some(issuer) => Ok(*issuer == self.issuer),
            None => Ok(true),
        }
    }

    /// True if `issuer_cert` validates this certificate under `opts`.
    pub fn certified_by_opts(
        &self,
        issuer_cert: &Certificate,
        opts: &CertifyOpts,
    ) -> bool {
        match self.verify_key(
            issuer_cert.subject_key(),
            Some(issuer_cert.subject()),
        ) {
            Ok(true) => {},
            _ => return false,
        }

        // Matching key identifiers, when either side exposes one.
        let issuer_ski = issuer_cert.subject_key_id();
        let own_aki = self.authority_key_id();
        if issuer_ski.is_some() || own_aki.is_some() {
            match (issuer_ski, own_aki) {
                (Some(ski), Some(aki)) if ski == aki => {},
                _ => return false,
            }
        }

        if opts.verify_time {
            let tstamp = opts.tstamp.unwrap_or_else(Utc::now);
            if tstamp < issuer_cert.not_before || tstamp > issuer_cert.not_after {
                return false;
            }
        }

        if opts.strict && !issuer_cert.is_ca() {
            return false;
        }

        true
    }

    pub fn certified_by(&self, issuer_cert: &Certificate) -> bool {
        self.certified_by_opts(issuer_cert, &CertifyOpts::default())
    }

    /// CA gate used by strict chain validation and CSR signing:
    /// BasicConstraints with `is_ca`, a SubjectKeyIdentifier, and
    /// KeyUsage including keyCertSign.
    pub fn is_ca(&self) -> bool {
        let basic = self.extensions.iter().find_map(|e| match &e.data {
            ExtensionData::BasicConstraints { is_ca, .. } => Some(*is_ca),
            _ => None,
        });
        let usage = self.extensions.iter().find_map(|e| match &e.data {
            ExtensionData::KeyUsage(bits) => Some(*bits),
            _ => None,
        });
        matches!(basic, Some(true))
            && self.subject_key_id().is_some()
            && usage.is_some_and(|u| u.contains(KeyUsageFlags::KEY_CERT_SIGN))
    }

    /// Signs a certification request with this certificate as issuer.
    ///
    /// An AuthorityKeyIdentifier is synthesized from this certificate's
    /// SubjectKeyIdentifier unless the caller supplied a matching one.
    #[allow(clippy::too_many_arguments)]
    pub fn sign(
        &self,
        csr: &crate::x509::csr::CertificationRequest,
        serial: impl Into<BigInt>,
        not_after: DateTime<Utc>,
        sign_key: &RsaKey,
        extensions: Vec<Extension>,
        not_before: Option<DateTime<Utc>>,
        subject_unique_id: Option<BitString>,
        strict: bool,
    ) -> Result<Certificate> {
        if sign_key.public()? != self.subject_key {
            return Err(Error::validation(
                "sign key does not match issuer public key",
            ));
        }
        if strict && !self.is_ca() {
            return Err(Error::auth("issuer lacks required CA extensions"));
        }

        let mut extensions = extensions;
        if let Some(identifier) = self.subject_key_id() {
            let supplied = extensions.iter().find_map(Extension::authority_key_id);
            match supplied {
                Some(set_id) => {
                    if set_id != identifier {
                        return Err(Error::validation(
                            "authority key identifier mismatch",
                        ));
                    }
                },
                None => extensions.push(Extension::authority_key_identifier(
                    Some(identifier.to_vec()),
                )),
            }
        }

        csr.sign(
            serial,
            self.subject.clone(),
            not_after,
            sign_key,
            extensions,
            not_before,
            self.subject_unique_id.clone(),
            subject_unique_id,
        )
    }

    /// Like [`Certificate::sign`] but grants the subject CA rights.
    #[allow(clippy::too_many_arguments)]
    pub fn sign_ca(
        &self,
        csr: &crate::x509::csr::CertificationRequest,
        serial: impl Into<BigInt>,
        not_after: DateTime<Utc>,
        sign_key: &RsaKey,
        path_len: Option<u64>,
        usage_bits: Option<KeyUsageFlags>,
        strict: bool,
    ) -> Result<Certificate> {
        let ca_exts =
            Extension::ca_extensions(csr.subject_key(), path_len, usage_bits)?;
        self.sign(
            csr,
            serial,
            not_after,
            sign_key,
            ca_exts,
            None,
            None,
            strict,
        )
    }

    /// The assembled certificate value.
    pub fn to_asn1(&self) -> Result<Value> {
        let mut seq = Constructed::new();
        seq.push_named(
            Value::Unknown(
                crate::asn1::Tag::universal(crate::asn1::tag::universal::SEQUENCE),
                self.tbs_der.clone(),
            ),
            "tbsCertificate",
        );
        let mut alg = Constructed::new();
        alg.push_named(
            Value::ObjectIdentifier(self.sign_alg.clone()),
            "algorithm",
        );
        alg.push_named(Value::Null, "parameters");
        seq.push_named(Value::Sequence(alg), "signatureAlgorithm");
        seq.push_named(
            Value::BitString(BitString::from_octets(self.signature.clone())),
            "signatureValue",
        );
        Ok(Value::Sequence(seq))
    }

    pub fn export(&self, fmt: X509Format) -> Result<Vec<u8>> {
        let der = self.to_asn1()?.encode_der()?;
        Ok(match fmt {
            X509Format::Der => der,
            X509Format::Pem => keys::encode_pem_block(keys::PEM_CERTIFICATE, &der),
        })
    }

    pub fn import_cert(data: &[u8], fmt: X509Format) -> Result<Certificate> {
        let der = match fmt {
            X509Format::Der => data.to_vec(),
            X509Format::Pem => {
                let (name, der) = keys::decode_pem_block(data)?;
                if name != keys::PEM_CERTIFICATE {
                    return Err(Error::parse(format!(
                        "unexpected PEM block {name}"
                    )));
                }
                der
            },
        };

        let value = certificate_def().parse_exact(&der)?;
        let seq = value
            .as_constructed()
            .ok_or_else(|| Error::parse("bad certificate"))?;

        // Slice the TBS bytes out of the original encoding so the
        // signature keeps verifying even for non-minimal inputs.
        let (outer_content, _) = {
            let (t, constructed, id_len) = crate::asn1::Tag::decode(&der)?;
            if t != crate::asn1::Tag::universal(
                crate::asn1::tag::universal::SEQUENCE,
            ) || !constructed
            {
                return Err(Error::parse("bad certificate"));
            }
            let (len, len_len) = crate::asn1::tag::decode_length(&der[id_len..])?;
            let len = len
                .ok_or_else(|| Error::parse("Indefinite length not supported"))?;
            (&der[id_len + len_len..id_len + len_len + len], 0usize)
        };
        let tbs_len = element_span(outer_content)?;
        let tbs_der = outer_content[..tbs_len].to_vec();

        let tbs = seq
            .get("tbsCertificate")
            .ok_or_else(|| Error::parse("bad certificate"))?;
        let signature = seq
            .get("signatureValue")
            .and_then(Value::as_bit_string)
            .ok_or_else(|| Error::parse("bad certificate"))?;
        if signature.unused != 0 {
            return Err(Error::parse("bad certificate"));
        }

        let mut cert = Certificate::from_parts(
            tbs,
            tbs_der,
            signature.data.clone(),
        )?;
        // The outer signature algorithm is authoritative.
        let outer_alg = seq
            .get("signatureAlgorithm")
            .and_then(Value::as_constructed)
            .and_then(|alg| alg.get("algorithm"))
            .and_then(Value::as_oid)
            .ok_or_else(|| Error::parse("bad certificate"))?;
        if *outer_alg != cert.sign_alg {
            return Err(Error::parse(
                "signature algorithm mismatch between TBS and certificate",
            ));
        }
        cert.sign_alg = outer_alg.clone();
        Ok(cert)
    }
}
