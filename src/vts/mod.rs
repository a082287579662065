// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! VTS secure channel: bridge, handshake roles, TLS delegation and the
//! early-byte transport multiplexer.

pub mod bridge;
mod client;
pub mod handshake;
pub mod mux;
mod server;
pub mod tls;

pub use bridge::{ChannelOptions, VtsChannel, VtsConfig};

use crate::{
    codec::hsvalue::HsValue,
    error::{Error, Result},
    vts::bridge::{HsStep, Role, Vts},
};

/// Role dispatch once the protocol hello has been received.
pub(crate) fn init_handshake(vts: &Vts) -> Result<()> {
    let role = vts.borrow().role;
    match role {
        Role::Client => client::init_handshake(vts),
        Role::Server => server::init_handshake(vts),
    }
}

/// Routes a completed handshake message to the state it was awaited in.
pub(crate) fn dispatch_handshake(vts: &Vts, value: HsValue) -> Result<()> {
    let step = vts.borrow().hs_step;
    match step {
        Some(HsStep::AwaitServerHello) => client::on_server_hello(vts, value),
        Some(HsStep::AwaitServerFinished) => client::on_server_finished(vts, value),
        Some(HsStep::AwaitClientHello) => server::on_client_hello(vts, value),
        Some(HsStep::AwaitClientKeyX) => server::on_client_keyx(vts, value),
        None => Err(Error::protocol("unexpected handshake message")),
    }
}
