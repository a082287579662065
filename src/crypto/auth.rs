// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Peer credential acceptance policy for secure channels.

use crate::{
    crypto::rsa::RsaKey,
    x509::{cert::Certificate, name::Name},
};

/// Policy hook consulted before a channel enters its running state.
///
/// The channel enforces `require_*` before calling
/// [`accept_credentials`](PeerAuthorizer::accept_credentials); the
/// default acceptance is permissive so implementors only override what
/// they care about.
pub trait PeerAuthorizer {
    /// Peer must present a public key.
    fn require_key(&self) -> bool {
        false
    }

    /// Peer must present a certificate chain.
    fn require_cert(&self) -> bool {
        false
    }

    /// The top of the peer chain must be, or be signed by, a trusted
    /// root.
    fn require_root(&self) -> bool {
        false
    }

    fn root_certificates(&self) -> &[Certificate] {
        &[]
    }

    /// Final say over the assembled peer credentials.
    fn accept_credentials(
        &self,
        _key: Option<&RsaKey>,
        _identity: Option<&Name>,
        _certificates: &[Certificate],
    ) -> bool {
        true
    }
}

/// Stock authorizer with explicit requirement flags and a root set.
#[derive(Default)]
pub struct Auth {
    require_key: bool,
    require_cert: bool,
    require_root: bool,
    roots: Vec<Certificate>,
}

impl Auth {
    pub fn new(require_key: bool, require_cert: bool, require_root: bool) -> Self {
        Auth {
            require_key,
            require_cert,
            require_root,
            roots: Vec::new(),
        }
    }

    pub fn add_root_certificate(&mut self, certificate: Certificate) {
        self.roots.push(certificate);
    }
}

impl PeerAuthorizer for Auth {
    fn require_key(&self) -> bool {
        self.require_key
    }

    fn require_cert(&self) -> bool {
        self.require_cert
    }

    fn require_root(&self) -> bool {
        self.require_root
    }

    fn root_certificates(&self) -> &[Certificate] {
        &self.roots
    }
}
