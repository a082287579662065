// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use chrono::{Duration, Utc};
use vts_channel_rs::{
    crypto::rsa::RsaKey,
    x509::{
        SUBJECT_KEY_ID_OID, X509Format,
        cert::{Certificate, CertifyOpts},
        csr::CertificationRequest,
        ext::{Extension, KeyUsageFlags},
        keys,
        name::Name,
    },
};

fn name(cn: &str) -> Name {
    let mut name = Name::new();
    name.set_attr("common_name", cn).expect("attr");
    name.set_attr("organization", "Test Channel Works").expect("attr");
    name
}

fn keypair() -> RsaKey {
    RsaKey::generate(512).expect("keypair")
}

#[test]
fn public_key_pkcs1_pem_roundtrip() {
    let key = keypair();
    let public = key.public().expect("public");
    let pem = keys::export_public_key(&public, X509Format::Pem).expect("export");
    let text = String::from_utf8(pem.clone()).expect("ascii");
    assert!(text.starts_with("-----BEGIN RSA PUBLIC KEY-----"));
    assert!(text.trim_end().ends_with("-----END RSA PUBLIC KEY-----"));
    let back = keys::import_public_key(&pem, X509Format::Pem).expect("import");
    assert_eq!(back, public);
}

#[test]
fn private_key_pkcs1_roundtrip_keeps_crt_parameters() {
    let key = keypair();
    let der = keys::export_private_key(&key, X509Format::Der).expect("export");
    let back = keys::import_private_key(&der, X509Format::Der).expect("import");
    assert_eq!(back, key);
    assert_eq!(back.exp1().expect("exp1"), key.exp1().expect("exp1"));
    assert_eq!(
        back.coefficient().expect("coeff"),
        key.coefficient().expect("coeff")
    );
}

#[test]
fn spki_roundtrip() {
    let key = keypair();
    let public = key.public().expect("public");
    let pem =
        keys::export_spki_public_key(&public, X509Format::Pem).expect("export");
    assert!(
        String::from_utf8_lossy(&pem).starts_with("-----BEGIN PUBLIC KEY-----")
    );
    let back = keys::import_spki_public_key(&pem, X509Format::Pem).expect("import");
    assert_eq!(back, public);
}

#[test]
fn pem_header_footer_mismatch() {
    let block = b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END PUBLIC KEY-----\n";
    assert!(keys::decode_pem_block(block).is_err());
}

fn self_signed_ca(key: &RsaKey, cn: &str) -> Certificate {
    let csr = CertificationRequest::create(&name(cn), key, &[]).expect("csr");
    csr.self_sign_ca(1, Utc::now() + Duration::days(365), key, None, None)
        .expect("self sign")
}

#[test]
fn certificate_self_sign_verifies() {
    let key = keypair();
    let cert = self_signed_ca(&key, "Root Test CA");
    let public = key.public().expect("public");
    assert!(cert.verify_key(&public, None).expect("verify"));
    assert!(
        cert.verify_key(&public, Some(cert.subject()))
            .expect("verify")
    );
    // Another key must not verify.
    let other = keypair().public().expect("public");
    assert!(!cert.verify_key(&other, None).expect("verify"));
    assert_eq!(cert.version(), 2);
}

#[test]
fn certificate_der_import_roundtrip() {
    let key = keypair();
    let cert = self_signed_ca(&key, "Root Test CA");
    let der = cert.export(X509Format::Der).expect("export");
    let back = Certificate::import_cert(&der, X509Format::Der).expect("import");
    assert_eq!(back, cert);
    let pem = cert.export(X509Format::Pem).expect("export");
    let back = Certificate::import_cert(&pem, X509Format::Pem).expect("import");
    assert_eq!(back, cert);
}

#[test]
fn ca_chain_certifies_end_entity() {
    let ca_key = keypair();
    let ca_cert = self_signed_ca(&ca_key, "Chain Root CA");
    assert!(ca_cert.is_ca());

    let leaf_key = keypair();
    let csr =
        CertificationRequest::create(&name("leaf.example"), &leaf_key, &[])
            .expect("csr");
    assert!(csr.verify());

    let leaf = ca_cert
        .sign(
            &csr,
            7,
            Utc::now() + Duration::days(30),
            &ca_key,
            Vec::new(),
            None,
            None,
            true,
        )
        .expect("sign");

    assert!(leaf.certified_by(&ca_cert));
    assert!(leaf.certified_by_opts(
        &ca_cert,
        &CertifyOpts {
            strict: false,
            ..CertifyOpts::default()
        }
    ));
    // An unrelated CA must not certify the leaf.
    let other_ca = self_signed_ca(&keypair(), "Other CA");
    assert!(!leaf.certified_by(&other_ca));
}

#[test]
fn aki_matches_issuer_ski() {
    let ca_key = keypair();
    let ca_cert = self_signed_ca(&ca_key, "SKI Root CA");
    let ski = ca_cert
        .extension(&SUBJECT_KEY_ID_OID)
        .and_then(Extension::subject_key_id)
        .expect("issuer SKI")
        .to_vec();

    let leaf_key = keypair();
    let csr = CertificationRequest::create(&name("aki.example"), &leaf_key, &[])
        .expect("csr");
    let leaf = ca_cert
        .sign(
            &csr,
            8,
            Utc::now() + Duration::days(30),
            &ca_key,
            Vec::new(),
            None,
            None,
            true,
        )
        .expect("sign");

    let aki = leaf
        .extensions()
        .iter()
        .find_map(Extension::authority_key_id)
        .expect("leaf AKI");
    assert_eq!(aki, ski.as_slice());

    // A supplied AKI that disagrees with the issuer SKI is rejected.
    let bad_aki = Extension::authority_key_identifier(Some(vec![0u8; 20]));
    let result = ca_cert.sign(
        &csr,
        9,
        Utc::now() + Duration::days(30),
        &ca_key,
        vec![bad_aki],
        None,
        None,
        true,
    );
    assert!(result.is_err());
}

#[test]
fn strict_signing_requires_ca_extensions() {
    let plain_key = keypair();
    let csr = CertificationRequest::create(&name("plain"), &plain_key, &[])
        .expect("csr");
    // Self-signed without CA extensions.
    let plain_cert = csr
        .self_sign(3, Utc::now() + Duration::days(10), &plain_key, Vec::new())
        .expect("self sign");
    assert!(!plain_cert.is_ca());

    let leaf_key = keypair();
    let leaf_csr =
        CertificationRequest::create(&name("denied"), &leaf_key, &[]).expect("csr");
    let result = plain_cert.sign(
        &leaf_csr,
        4,
        Utc::now() + Duration::days(5),
        &plain_key,
        Vec::new(),
        None,
        None,
        true,
    );
    assert!(result.is_err());
}

#[test]
fn expired_issuer_fails_time_check() {
    let ca_key = keypair();
    let csr = CertificationRequest::create(&name("Expiring CA"), &ca_key, &[])
        .expect("csr");
    let ca_cert = csr
        .self_sign_ca(5, Utc::now() + Duration::days(3650), &ca_key, None, None)
        .expect("self sign");

    let leaf_key = keypair();
    let leaf_csr =
        CertificationRequest::create(&name("timed"), &leaf_key, &[]).expect("csr");
    let leaf = ca_cert
        .sign(
            &leaf_csr,
            6,
            Utc::now() + Duration::days(30),
            &ca_key,
            Vec::new(),
            None,
            None,
            true,
        )
        .expect("sign");

    // Validation at a timestamp before the issuer became valid fails.
    let before = Utc::now() - Duration::days(30);
    assert!(!leaf.certified_by_opts(
        &ca_cert,
        &CertifyOpts {
            tstamp: Some(before),
            ..CertifyOpts::default()
        }
    ));
    assert!(leaf.certified_by(&ca_cert));
}

#[test]
fn csr_roundtrip_and_verification() {
    let key = keypair();
    let csr = CertificationRequest::create(&name("request.example"), &key, &[])
        .expect("csr");
    let pem = csr.export(X509Format::Pem).expect("export");
    assert!(
        String::from_utf8_lossy(&pem)
            .starts_with("-----BEGIN CERTIFICATE REQUEST-----")
    );
    let back =
        CertificationRequest::import_request(&pem, X509Format::Pem).expect("import");
    assert_eq!(back, csr);
    assert!(back.verify());
    assert_eq!(back.subject().get_attr("common_name"), Some("request.example"));
}

#[test]
fn key_usage_gates_signing() {
    let ca_key = keypair();
    let csr = CertificationRequest::create(&name("No Sign CA"), &ca_key, &[])
        .expect("csr");
    // CA extensions but without keyCertSign.
    let ca_cert = csr
        .self_sign_ca(
            10,
            Utc::now() + Duration::days(30),
            &ca_key,
            None,
            Some(KeyUsageFlags::CRL_SIGN),
        )
        .expect("self sign");
    assert!(!ca_cert.is_ca());
}
