// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use serial_test::serial;
use vts_channel_rs::{
    io::{link, sock::SocketAgent},
    reactor::Reactor,
    vts::{ChannelOptions, VtsChannel},
};

use crate::integration_tests::common::{attach_app, pump_until, test_keypair};

fn tcp_pair() -> (mio::net::TcpStream, mio::net::TcpStream) {
    let listener =
        std::net::TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let addr = listener.local_addr().expect("listener addr");
    let client = std::net::TcpStream::connect(addr).expect("connect");
    let (server, _) = listener.accept().expect("accept");
    client.set_nonblocking(true).expect("nonblocking");
    server.set_nonblocking(true).expect("nonblocking");
    client.set_nodelay(true).expect("nodelay");
    server.set_nodelay(true).expect("nodelay");
    (
        mio::net::TcpStream::from_std(client),
        mio::net::TcpStream::from_std(server),
    )
}

#[test]
#[serial]
fn secure_channel_over_tcp_loopback() {
    let mut reactor = Reactor::new().expect("reactor");
    let local = reactor.local();
    let (client_stream, server_stream) = tcp_pair();

    let client_sock =
        SocketAgent::register(&local, client_stream, 1 << 20).expect("client sock");
    let server_sock =
        SocketAgent::register(&local, server_stream, 1 << 20).expect("server sock");

    let client = VtsChannel::client(
        &local,
        ChannelOptions {
            keypair: Some(test_keypair()),
            ..ChannelOptions::default()
        },
    )
    .expect("client channel");
    let server = VtsChannel::server(
        &local,
        ChannelOptions {
            keypair: Some(test_keypair()),
            ..ChannelOptions::default()
        },
    )
    .expect("server channel");

    // Wire: bridge ciphertext out -> socket write side, socket read
    // side -> bridge ciphertext in, on both ends.
    link(&client_sock.consumer, &client.cipher_produce).expect("link");
    link(&client.cipher_consume, &client_sock.producer).expect("link");
    link(&server_sock.consumer, &server.cipher_produce).expect("link");
    link(&server.cipher_consume, &server_sock.producer).expect("link");

    let client_app = attach_app(&client);
    let server_app = attach_app(&server);

    assert!(pump_until(&mut reactor, Duration::from_secs(15), || {
        client.is_running() && server.is_running()
    }));

    let request: Vec<u8> = (0..60_000usize).map(|i| (i % 253) as u8).collect();
    client_app.source.borrow_mut().send(&request).expect("send");
    server_app
        .source
        .borrow_mut()
        .send(b"short response")
        .expect("send");

    assert!(pump_until(&mut reactor, Duration::from_secs(20), || {
        server_app.sink.borrow().received().len() == request.len()
            && client_app.sink.borrow().received() == b"short response"
    }));
    assert_eq!(server_app.sink.borrow().received(), request.as_slice());
}

#[test]
#[serial]
fn clean_shutdown_propagates_end_of_data() {
    let mut reactor = Reactor::new().expect("reactor");
    let local = reactor.local();
    let (client_stream, server_stream) = tcp_pair();

    let client_sock =
        SocketAgent::register(&local, client_stream, 1 << 20).expect("client sock");
    let server_sock =
        SocketAgent::register(&local, server_stream, 1 << 20).expect("server sock");

    let client = VtsChannel::client(&local, ChannelOptions::default())
        .expect("client channel");
    let server = VtsChannel::server(
        &local,
        ChannelOptions {
            keypair: Some(test_keypair()),
            ..ChannelOptions::default()
        },
    )
    .expect("server channel");

    link(&client_sock.consumer, &client.cipher_produce).expect("link");
    link(&client.cipher_consume, &client_sock.producer).expect("link");
    link(&server_sock.consumer, &server.cipher_produce).expect("link");
    link(&server.cipher_consume, &server_sock.producer).expect("link");

    let client_app = attach_app(&client);
    let server_app = attach_app(&server);

    assert!(pump_until(&mut reactor, Duration::from_secs(15), || {
        client.is_running() && server.is_running()
    }));

    client_app
        .source
        .borrow_mut()
        .send(b"goodbye")
        .expect("send");
    assert!(pump_until(&mut reactor, Duration::from_secs(10), || {
        server_app.sink.borrow().received() == b"goodbye"
    }));

    // Ending the client plaintext intake drains through the socket FIN
    // and surfaces as a clean end on the server's plaintext producer.
    client_app.source.borrow_mut().end(true);
    assert!(pump_until(&mut reactor, Duration::from_secs(10), || {
        server_app.sink.borrow().ended() == Some(true)
    }));
}
