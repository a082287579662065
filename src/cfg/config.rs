// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    cfg::enums::TransportKind,
    crypto::{
        block::{CipherAlgo, CipherMode},
        hashes::HashKind,
        message::PadGenerator,
    },
    vts::{VtsConfig, mux::TransportMask},
};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Cipher/hash preference lists and channel resource limits.
    pub channel: ChannelSettings,
    /// Transports the connection multiplexer may select.
    pub transports: TransportSettings,
    /// Implementation/runtime parameters outside the wire protocol.
    pub runtime: RuntimeConfig,
}

/// One cipher with its acceptable chaining modes, in preference order.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CipherSuite {
    #[serde(rename = "Name")]
    pub name: CipherAlgo,
    #[serde(rename = "Modes")]
    pub modes: Vec<CipherMode>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ChannelSettings {
    #[serde(rename = "HmacHashes")]
    /// Handshake HMAC hash methods offered, in preference order.
    pub hmac_hashes: Vec<HashKind>,

    #[serde(rename = "Ciphers")]
    /// Symmetric ciphers offered, in preference order.
    pub ciphers: Vec<CipherSuite>,

    #[serde(rename = "Hashes")]
    /// Message-validation hash methods offered.
    pub hashes: Vec<HashKind>,

    #[serde(rename = "ReadBufferLength", default = "default_buffer")]
    /// Per-direction read buffer bound in bytes.
    pub read_buffer_len: u32,

    #[serde(rename = "MaxWrite", default = "default_buffer")]
    /// Largest single downstream write in bytes.
    pub max_write: u32,

    #[serde(rename = "HandshakeLimit", default = "default_hshake_lim")]
    /// Bound on a single handshake message; absent disables the check.
    pub handshake_limit: Option<u64>,

    #[serde(rename = "MaxKeyLength", default = "default_max_keylen")]
    /// Bound on accepted peer key width in bytes.
    pub max_key_len: Option<u32>,

    #[serde(rename = "Padding", default)]
    /// Source of frame padding bytes.
    pub padding: PadGenerator,
}

fn default_buffer() -> u32 {
    0x4000
}

fn default_hshake_lim() -> Option<u64> {
    Some(16384)
}

fn default_max_keylen() -> Option<u32> {
    Some(4096 / 8)
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TransportSettings {
    #[serde(rename = "Enabled")]
    /// Transports accepted on inbound connections.
    pub enabled: Vec<TransportKind>,

    #[serde(
        rename = "RequireSecure",
        default = "require_secure_default",
        with = "yes_no"
    )]
    /// Refuse to fall back to plaintext even if listed.
    pub require_secure: bool,
}

fn require_secure_default() -> bool {
    true
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    #[serde(rename = "HandshakeTimeout", with = "serde_secs")]
    /// Deadline for completing the channel handshake.
    pub handshake_timeout: Duration,

    #[serde(rename = "TimeoutConnection", with = "serde_secs")]
    /// Timeout for establishing the TCP connection.
    pub timeout_connection: Duration,
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns
    /// the ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            !self.channel.hmac_hashes.is_empty(),
            "HmacHashes must not be empty"
        );
        ensure!(!self.channel.ciphers.is_empty(), "Ciphers must not be empty");
        for suite in &self.channel.ciphers {
            ensure!(
                !suite.modes.is_empty(),
                "cipher {} lists no modes",
                suite.name
            );
        }
        ensure!(!self.channel.hashes.is_empty(), "Hashes must not be empty");
        ensure!(
            !self.transports.enabled.is_empty(),
            "at least one transport must be enabled"
        );

        // Secure deployments must not fall back to plaintext.
        if self.transports.require_secure {
            self.transports
                .enabled
                .retain(|t| *t != TransportKind::Plain);
            ensure!(
                !self.transports.enabled.is_empty(),
                "RequireSecure removed every enabled transport"
            );
        } else if self.transports.enabled.contains(&TransportKind::Plain) {
            warn!("insecure plaintext transport is enabled");
        }

        if self.channel.handshake_limit.is_none()
            || self.channel.max_key_len.is_none()
        {
            warn!(
                "running without HandshakeLimit or MaxKeyLength leaves the \
                 handshake open to resource exhaustion"
            );
        }
        if let Some(lim) = self.channel.handshake_limit {
            ensure!(lim >= 1024, "HandshakeLimit must be at least 1024 bytes");
        }
        ensure!(
            self.runtime.handshake_timeout > Duration::ZERO,
            "HandshakeTimeout must be positive"
        );
        Ok(())
    }

    /// Channel-level view of the configuration.
    pub fn vts_config(&self) -> VtsConfig {
        VtsConfig {
            hmac_hashes: self.channel.hmac_hashes.clone(),
            ciphers: self
                .channel
                .ciphers
                .iter()
                .map(|suite| (suite.name, suite.modes.clone()))
                .collect(),
            hashes: self.channel.hashes.clone(),
            pub_ciphers: vec!["rsa".to_string()],
            rbuf_len: i64::from(self.channel.read_buffer_len),
            max_write: i64::from(self.channel.max_write),
            hshake_lim: self.channel.handshake_limit,
            max_keylen: self.channel.max_key_len.map(|v| v as usize),
            padding: self.channel.padding,
        }
    }

    /// Transport bitmask for the connection multiplexer.
    pub fn transport_mask(&self) -> TransportMask {
        self.transports
            .enabled
            .iter()
            .fold(TransportMask::empty(), |mask, t| mask | t.mask_bit())
    }
}

/// Serde helpers for timeout knobs written as whole seconds. A zero
/// is accepted here and rejected by validation, which can point at the
/// offending key.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        struct Seconds;

        impl serde::de::Visitor<'_> for Seconds {
            type Value = Duration;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a number of whole seconds")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Duration, E> {
                u64::try_from(v)
                    .map(Duration::from_secs)
                    .map_err(|_| E::custom("seconds must be non-negative"))
            }
        }

        d.deserialize_u64(Seconds)
    }
}

/// Serde helpers for the `Yes`/`No` switches the configuration file
/// uses; plain booleans are accepted as well.
mod yes_no {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &bool, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(if *v { "Yes" } else { "No" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        struct Switch;

        impl serde::de::Visitor<'_> for Switch {
            type Value = bool;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("Yes, No, or a boolean")
            }

            fn visit_bool<E: serde::de::Error>(self, v: bool) -> Result<bool, E> {
                Ok(v)
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<bool, E> {
                match v {
                    "Yes" | "yes" | "YES" => Ok(true),
                    "No" | "no" | "NO" => Ok(false),
                    other => Err(E::custom(format!(
                        "expected Yes or No, got {other:?}"
                    ))),
                }
            }
        }

        d.deserialize_any(Switch)
    }
}
