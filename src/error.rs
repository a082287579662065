// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Crate-wide error taxonomy.
//!
//! Codec and parse errors bubble to the caller of the parse/encode entry
//! point without exposing partial state. Inside the channel bridge,
//! protocol/auth/crypto failures are routed into the cascading abort
//! path instead of crossing the reactor loop.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed ASN.1 / PEM / certificate / handshake input.
    #[error("parse error: {0}")]
    Parse(String),

    /// A structural invariant does not hold (key parameters, path
    /// lengths, field ranges).
    #[error("validation error: {0}")]
    Validation(String),

    /// Signature verification failure, key identifier mismatch, or peer
    /// credentials rejected by policy.
    #[error("authorization error: {0}")]
    Auth(String),

    /// Transform or digest failure, MAC mismatch, padding violation.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Wire protocol violation: bad hello, unsupported version,
    /// handshake limits exceeded, oversize keys.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Descriptor or pipe failure, reactor stopped, flow misuse.
    #[error("resource error: {0}")]
    Resource(String),

    /// An awaited result was cancelled or timed out.
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn parse(msg: impl Into<String>) -> Self {
        Error::Parse(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Error::Auth(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Error::Resource(msg.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
