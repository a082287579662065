// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::vts::mux::TransportMask;

/// Transports selectable by the connection multiplexer.
///
/// Insecure plaintext must be enabled explicitly; it is never part of
/// a default configuration.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    #[serde(rename = "VTS", alias = "vts")]
    Vts,
    #[serde(rename = "TLS", alias = "tls")]
    Tls,
    #[serde(rename = "Plain", alias = "plain", alias = "insecure")]
    Plain,
}

impl TransportKind {
    pub fn mask_bit(self) -> TransportMask {
        match self {
            TransportKind::Vts => TransportMask::VTS,
            TransportKind::Tls => TransportMask::TLS,
            TransportKind::Plain => TransportMask::PLAIN,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Vts => "VTS",
            TransportKind::Tls => "TLS",
            TransportKind::Plain => "Plain",
        })
    }
}
