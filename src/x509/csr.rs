// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! PKCS#10 certification requests.

use chrono::{DateTime, Utc};
use num_bigint_dig::BigInt;

use crate::{
    asn1::{BitString, Def, Oid, SequenceDef, TaggedValue, Value, value::Constructed},
    crypto::{hashes::HashKind, rsa::RsaKey},
    error::{Error, Result},
    x509::{
        SHA1_WITH_RSA_OID, X509Format,
        cert::{CertParams, Certificate},
        ext::{Extension, KeyUsageFlags},
        keys,
        name::Name,
        sign,
    },
};

pub fn cert_request_info_def() -> Def {
    Def::sequence(
        SequenceDef::new()
            .field(Def::Integer, "version")
            .field(Name::def(), "subject")
            .field(keys::spki_def(), "subjectPKInfo")
            .optional(
                Def::implicit(0, Def::set_of(Def::Any { allow_unknown: true })),
                "attributes",
            ),
    )
}

pub fn cert_request_def() -> Def {
    Def::sequence(
        SequenceDef::new()
            .field(cert_request_info_def(), "certificationRequestInfo")
            .field(keys::algorithm_identifier_def(), "signatureAlgorithm")
            .field(Def::BitString, "signature"),
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct CertificationRequest {
    subject: Name,
    subject_key: RsaKey,
    attributes: Vec<Value>,
    sign_alg: Oid,
    cri_der: Vec<u8>,
    signature: Vec<u8>,
}

impl CertificationRequest {
    /// CertificationRequestInfo value: version 0, subject, SPKI, and
    /// the `[0]` IMPLICIT attribute set.
    pub fn create_req_info(
        subject: &Name,
        subject_key: &RsaKey,
        attributes: &[Value],
    ) -> Result<Value> {
        let mut cri = Constructed::new();
        cri.push_named(Value::integer(0), "version");
        cri.push_named(subject.to_asn1(), "subject");
        cri.push_named(keys::spki_value(subject_key)?, "subjectPKInfo");
        let mut attrs = Constructed::new();
        for attr in attributes {
            attrs.push(attr.clone());
        }
        cri.push_named(
            Value::Tagged(Box::new(TaggedValue {
                tag: crate::asn1::Tag::context(0),
                explicit: false,
                inner: Value::SetOf(attrs),
            })),
            "attributes",
        );
        Ok(Value::Sequence(cri))
    }

    /// Creates a request self-signed with the subject keypair.
    pub fn create(
        subject: &Name,
        subject_keypair: &RsaKey,
        attributes: &[Value],
    ) -> Result<CertificationRequest> {
        if !subject_keypair.has_private() || !subject_keypair.has_public() {
            return Err(Error::validation(
                "certification request requires a full keypair",
            ));
        }
        let cri =
            CertificationRequest::create_req_info(subject, subject_keypair, attributes)?;
        let cri_der = cri.encode_der()?;
        let signature =
            sign::rsassa_pkcs1_v1_5_sign(subject_keypair, HashKind::Sha1, &cri_der)?;
        Ok(CertificationRequest {
            subject: subject.clone(),
            subject_key: subject_keypair.public()?,
            attributes: attributes.to_vec(),
            sign_alg: SHA1_WITH_RSA_OID.clone(),
            cri_der,
            signature,
        })
    }

    pub fn subject(&self) -> &Name {
        &self.subject
    }

    pub fn subject_key(&self) -> &RsaKey {
        &self.subject_key
    }

    pub fn attributes(&self) -> &[Value] {
        &self.attributes
    }

    pub fn sign_algorithm(&self) -> &Oid {
        &self.sign_alg
    }

    /// Verifies the request against its embedded subject key.
    pub fn verify(&self) -> bool {
        self.sign_alg == *SHA1_WITH_RSA_OID
            && sign::rsassa_pkcs1_v1_5_verify(
                &self.subject_key,
                HashKind::Sha1,
                &self.cri_der,
                &self.signature,
            )
    }

    /// Issues a certificate for this request.
    #[allow(clippy::too_many_arguments)]
    pub fn sign(
        &self,
        serial: impl Into<BigInt>,
        issuer: Name,
        not_after: DateTime<Utc>,
        sign_key: &RsaKey,
        extensions: Vec<Extension>,
        not_before: Option<DateTime<Utc>>,
        issuer_unique_id: Option<BitString>,
        subject_unique_id: Option<BitString>,
    ) -> Result<Certificate> {
        if !self.verify() {
            return Err(Error::auth(
                "certification request does not verify against subject key",
            ));
        }
        let mut params =
            CertParams::new(serial, issuer, not_after, self.subject.clone());
        params.not_before = not_before;
        params.issuer_unique_id = issuer_unique_id;
        params.subject_unique_id = subject_unique_id;
        params.extensions = extensions;
        Certificate::create(&params, &self.subject_key, sign_key)
    }

    /// Self-issues a certificate, the subject acting as issuer.
    pub fn self_sign(
        &self,
        serial: impl Into<BigInt>,
        not_after: DateTime<Utc>,
        sign_key: &RsaKey,
        extensions: Vec<Extension>,
    ) -> Result<Certificate> {
        if sign_key.public()? != self.subject_key {
            return Err(Error::validation(
                "self-sign key does not match request subject key",
            ));
        }
        self.sign(
            serial,
            self.subject.clone(),
            not_after,
            sign_key,
            extensions,
            None,
            None,
            None,
        )
    }

    /// Self-issues a CA certificate with the CA extension set.
    pub fn self_sign_ca(
        &self,
        serial: impl Into<BigInt>,
        not_after: DateTime<Utc>,
        sign_key: &RsaKey,
        path_len: Option<u64>,
        usage_bits: Option<KeyUsageFlags>,
    ) -> Result<Certificate> {
        let extensions =
            Extension::ca_extensions(&self.subject_key, path_len, usage_bits)?;
        self.self_sign(serial, not_after, sign_key, extensions)
    }

    pub fn to_asn1(&self) -> Result<Value> {
        let mut seq = Constructed::new();
        seq.push_named(
            Value::Unknown(
                crate::asn1::Tag::universal(crate::asn1::tag::universal::SEQUENCE),
                self.cri_der.clone(),
            ),
            "certificationRequestInfo",
        );
        let mut alg = Constructed::new();
        alg.push_named(Value::ObjectIdentifier(self.sign_alg.clone()), "algorithm");
        alg.push_named(Value::Null, "parameters");
        seq.push_named(Value::Sequence(alg), "signatureAlgorithm");
        seq.push_named(
            Value::BitString(BitString::from_octets(self.signature.clone())),
            "signature",
        );
        Ok(Value::Sequence(seq))
    }

    pub fn export(&self, fmt: X509Format) -> Result<Vec<u8>> {
        let der = self.to_asn1()?.encode_der()?;
        Ok(match fmt {
            X509Format::Der => der,
            X509Format::Pem => keys::encode_pem_block(keys::PEM_CERT_REQUEST, &der),
        })
    }

    pub fn import_request(data: &[u8], fmt: X509Format) -> Result<Self> {
        let der = match fmt {
            X509Format::Der => data.to_vec(),
            X509Format::Pem => {
                let (name, der) = keys::decode_pem_block(data)?;
                if name != keys::PEM_CERT_REQUEST {
                    return Err(Error::parse(format!(
                        "unexpected PEM block {name}"
                    )));
                }
                der
            },
        };

        let value = cert_request_def().parse_exact(&der)?;
        let seq = value
            .as_constructed()
            .ok_or_else(|| Error::parse("bad certification request"))?;
        let cri = seq
            .get("certificationRequestInfo")
            .and_then(Value::as_constructed)
            .ok_or_else(|| Error::parse("bad certification request"))?;
        let version = cri
            .get("version")
            .and_then(Value::as_integer)
            .ok_or_else(|| Error::parse("bad certification request"))?;
        if *version != BigInt::from(0) {
            return Err(Error::parse("unsupported certification request version"));
        }
        let subject = Name::from_asn1(
            cri.get("subject")
                .ok_or_else(|| Error::parse("bad certification request"))?,
        )?;
        let subject_key = keys::key_from_spki(
            cri.get("subjectPKInfo")
                .ok_or_else(|| Error::parse("bad certification request"))?,
        )?;
        let attributes = match cri.get("attributes") {
            Some(wrapped) => wrapped
                .untagged()
                .as_constructed()
                .map(|set| set.values().cloned().collect())
                .unwrap_or_default(),
            None => Vec::new(),
        };
        let sign_alg = seq
            .get("signatureAlgorithm")
            .and_then(Value::as_constructed)
            .and_then(|alg| alg.get("algorithm"))
            .and_then(Value::as_oid)
            .ok_or_else(|| Error::parse("bad certification request"))?
            .clone();
        let signature = seq
            .get("signature")
            .and_then(Value::as_bit_string)
            .ok_or_else(|| Error::parse("bad certification request"))?;
        if signature.unused != 0 {
            return Err(Error::parse("bad certification request"));
        }

        // Keep the original CRI bytes for signature verification.
        let cri_der = {
            let (t, constructed, id_len) = crate::asn1::Tag::decode(&der)?;
            if t != crate::asn1::Tag::universal(
                crate::asn1::tag::universal::SEQUENCE,
            ) || !constructed
            {
                return Err(Error::parse("bad certification request"));
            }
            let (len, len_len) =
                crate::asn1::tag::decode_length(&der[id_len..])?;
            let len = len
                .ok_or_else(|| Error::parse("Indefinite length not supported"))?;
            let content = &der[id_len + len_len..id_len + len_len + len];
            let cri_len = crate::asn1::def::element_span(content)?;
            content[..cri_len].to_vec()
        };

        Ok(CertificationRequest {
            subject,
            subject_key,
            attributes,
            sign_alg,
            cri_der,
            signature: signature.data.clone(),
        })
    }
}
