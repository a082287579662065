// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    cell::RefCell,
    rc::Rc,
    time::{Duration, Instant},
};

use vts_channel_rs::{
    crypto::rsa::RsaKey,
    io::{
        ConsumerRef, ProducerRef, link,
        util::{BufferSink, BufferSource},
    },
    reactor::Reactor,
    vts::{ChannelOptions, VtsChannel},
};

/// Drives the reactor until `cond` holds or `timeout` elapses.
pub fn pump_until(
    reactor: &mut Reactor,
    timeout: Duration,
    mut cond: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        reactor
            .loop_once(Some(Duration::from_millis(5)))
            .expect("reactor loop");
    }
}

/// Runs a fixed number of loop iterations.
pub fn pump(reactor: &mut Reactor, rounds: usize) {
    for _ in 0..rounds {
        reactor
            .loop_once(Some(Duration::from_millis(2)))
            .expect("reactor loop");
    }
}

pub fn test_keypair() -> RsaKey {
    RsaKey::generate(512).expect("test keypair")
}

/// Application endpoints bound to one bridge's plaintext side.
pub struct AppSide {
    pub source: Rc<RefCell<BufferSource>>,
    pub sink: Rc<RefCell<BufferSink>>,
}

/// Attaches an in-memory source and sink to a channel's plaintext side.
pub fn attach_app(channel: &VtsChannel) -> AppSide {
    let source = BufferSource::new();
    let sink = BufferSink::unbounded();
    let source_ref: ProducerRef = source.clone();
    let sink_ref: ConsumerRef = sink.clone();
    link(&channel.plain_consume, &source_ref).expect("link source");
    link(&sink_ref, &channel.plain_produce).expect("link sink");
    AppSide { source, sink }
}

/// Builds a client/server channel pair with directly linked cipher
/// sides.
pub fn direct_channel_pair(
    reactor: &Reactor,
    client_opts: ChannelOptions,
    server_opts: ChannelOptions,
) -> (VtsChannel, VtsChannel) {
    let local = reactor.local();
    let client = VtsChannel::client(&local, client_opts).expect("client channel");
    let server = VtsChannel::server(&local, server_opts).expect("server channel");
    link(&server.cipher_consume, &client.cipher_produce).expect("link c->s");
    link(&client.cipher_consume, &server.cipher_produce).expect("link s->c");
    (client, server)
}
