// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result};
use vts_channel_rs::{
    cfg::{
        cli::resolve_config_path,
        config::Config,
        enums::TransportKind,
    },
    crypto::{
        block::{CipherAlgo, CipherMode},
        hashes::HashKind,
    },
    vts::mux::TransportMask,
};

#[test]
fn test_load_config() -> Result<()> {
    let cfg = resolve_config_path("tests/config.yaml")
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;

    assert_eq!(cfg.channel.hmac_hashes, vec![HashKind::Sha256]);
    assert_eq!(cfg.channel.ciphers.len(), 2);
    assert_eq!(cfg.channel.ciphers[0].name, CipherAlgo::Aes256);
    assert_eq!(
        cfg.channel.ciphers[0].modes,
        vec![CipherMode::Cbc, CipherMode::Ofb]
    );
    assert_eq!(cfg.channel.hashes, vec![HashKind::Sha1]);
    assert_eq!(cfg.channel.handshake_limit, Some(16384));
    assert_eq!(cfg.channel.max_key_len, Some(512));
    assert_eq!(cfg.runtime.handshake_timeout.as_secs(), 30);

    let vts = cfg.vts_config();
    assert_eq!(vts.hshake_lim, Some(16384));
    assert_eq!(vts.max_keylen, Some(512));
    assert_eq!(vts.ciphers[0].0, CipherAlgo::Aes256);

    assert_eq!(cfg.transport_mask(), TransportMask::VTS | TransportMask::TLS);
    Ok(())
}

#[test]
fn test_require_secure_strips_plaintext() -> Result<()> {
    let mut cfg = resolve_config_path("tests/config.yaml")
        .and_then(Config::load_from_file)?;
    cfg.transports.enabled.push(TransportKind::Plain);
    cfg.validate_and_normalize()?;
    assert!(!cfg.transports.enabled.contains(&TransportKind::Plain));
    Ok(())
}

#[test]
fn test_empty_preferences_rejected() -> Result<()> {
    let mut cfg = resolve_config_path("tests/config.yaml")
        .and_then(Config::load_from_file)?;
    cfg.channel.hmac_hashes.clear();
    assert!(cfg.validate_and_normalize().is_err());
    Ok(())
}

#[test]
fn test_small_handshake_limit_rejected() -> Result<()> {
    let mut cfg = resolve_config_path("tests/config.yaml")
        .and_then(Config::load_from_file)?;
    cfg.channel.handshake_limit = Some(100);
    assert!(cfg.validate_and_normalize().is_err());
    Ok(())
}
