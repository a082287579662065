// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{cell::RefCell, rc::Rc, time::Duration};

use serial_test::serial;
use vts_channel_rs::{
    io::{
        ConsumerRef, ProducerRef, link,
        util::{BufferSink, BufferSource},
    },
    reactor::Reactor,
    vts::{
        ChannelOptions, VtsChannel,
        mux::{
            CipherEndpoints, SelectedTransport, TransportMask, VopMultiplexer,
        },
    },
};

use crate::integration_tests::common::{attach_app, pump_until, test_keypair};

#[test]
#[serial]
fn first_byte_selects_vts() {
    let mut reactor = Reactor::new().expect("reactor");
    let local = reactor.local();

    // Server side sits behind the multiplexer; its bridge is built
    // lazily once the first byte classifies the connection.
    let server_slot: Rc<RefCell<Option<VtsChannel>>> = Rc::new(RefCell::new(None));
    let selector = {
        let local = local.clone();
        let server_slot = server_slot.clone();
        Box::new(move |transport: SelectedTransport| {
            assert_eq!(transport, SelectedTransport::Vts);
            let server = VtsChannel::server(
                &local,
                ChannelOptions {
                    keypair: Some(test_keypair()),
                    ..ChannelOptions::default()
                },
            )?;
            let endpoints = CipherEndpoints {
                consumer: server.cipher_consume.clone(),
                producer: server.cipher_produce.clone(),
            };
            *server_slot.borrow_mut() = Some(server);
            Ok(endpoints)
        })
    };
    let mux = VopMultiplexer::new(&local, TransportMask::default(), selector);

    let client = VtsChannel::client(
        &local,
        ChannelOptions {
            keypair: Some(test_keypair()),
            ..ChannelOptions::default()
        },
    )
    .expect("client channel");
    link(&mux.cipher_consume, &client.cipher_produce).expect("link c->mux");
    link(&client.cipher_consume, &mux.cipher_produce).expect("link mux->c");
    let client_app = attach_app(&client);

    assert!(pump_until(&mut reactor, Duration::from_secs(15), || {
        mux.selected().is_some()
    }));
    assert_eq!(mux.selected(), Some(SelectedTransport::Vts));

    let server_app = {
        let slot = server_slot.borrow();
        attach_app(slot.as_ref().expect("server built"))
    };

    assert!(pump_until(&mut reactor, Duration::from_secs(15), || {
        let slot = server_slot.borrow();
        client.is_running()
            && slot.as_ref().is_some_and(VtsChannel::is_running)
    }));

    client_app
        .source
        .borrow_mut()
        .send(b"dispatched by first byte")
        .expect("send");
    assert!(pump_until(&mut reactor, Duration::from_secs(10), || {
        server_app.sink.borrow().received() == b"dispatched by first byte"
    }));
}

#[test]
#[serial]
fn plaintext_is_rejected_by_default() {
    let mut reactor = Reactor::new().expect("reactor");
    let local = reactor.local();

    let mux = VopMultiplexer::new(
        &local,
        TransportMask::default(),
        Box::new(|_| panic!("no transport should be selected")),
    );

    let source = BufferSource::new();
    let sink = BufferSink::unbounded();
    let source_ref: ProducerRef = source.clone();
    let sink_ref: ConsumerRef = sink.clone();
    link(&mux.cipher_consume, &source_ref).expect("link source");
    link(&sink_ref, &mux.cipher_produce).expect("link sink");

    // Not a VTS hello and not a TLS record: insecure plaintext, which
    // the default mask refuses.
    let result = source.borrow_mut().send(b"GET / HTTP/1.0\r\n");
    assert!(result.is_err());
    assert!(pump_until(&mut reactor, Duration::from_secs(5), || {
        sink.borrow().is_aborted()
    }));
    assert_eq!(mux.selected(), None);
}

#[test]
#[serial]
fn plaintext_passes_when_enabled() {
    let mut reactor = Reactor::new().expect("reactor");
    let local = reactor.local();

    // The "transport" for plaintext is the application itself.
    let app_rx = BufferSink::unbounded();
    let app_tx = BufferSource::new();
    let selector = {
        let app_rx = app_rx.clone();
        let app_tx = app_tx.clone();
        Box::new(move |transport: SelectedTransport| {
            assert_eq!(transport, SelectedTransport::Plain);
            Ok(CipherEndpoints {
                consumer: app_rx.clone() as ConsumerRef,
                producer: app_tx.clone() as ProducerRef,
            })
        })
    };
    let mux = VopMultiplexer::new(
        &local,
        TransportMask::default() | TransportMask::PLAIN,
        selector,
    );

    let wire_in = BufferSource::new();
    let wire_out = BufferSink::unbounded();
    let wire_in_ref: ProducerRef = wire_in.clone();
    let wire_out_ref: ConsumerRef = wire_out.clone();
    link(&mux.cipher_consume, &wire_in_ref).expect("link wire in");
    link(&wire_out_ref, &mux.cipher_produce).expect("link wire out");

    wire_in
        .borrow_mut()
        .send(b"plain business")
        .expect("send");
    assert!(pump_until(&mut reactor, Duration::from_secs(5), || {
        app_rx.borrow().received() == b"plain business"
    }));
    assert_eq!(mux.selected(), Some(SelectedTransport::Plain));

    // And the return path reaches the wire.
    app_tx.borrow_mut().send(b"plain reply").expect("send");
    assert!(pump_until(&mut reactor, Duration::from_secs(5), || {
        wire_out.borrow().received() == b"plain reply"
    }));
}
