// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    cell::RefCell,
    rc::Rc,
    time::Duration,
};

use chrono::Utc;
use vts_channel_rs::{
    crypto::auth::Auth,
    error::Result,
    io::{
        ByteConsumer, ByteProducer, ConsumerRef, ProducerRef, UNBOUNDED,
        buf::ByteBuf, link,
    },
    reactor::Reactor,
    vts::{ChannelOptions, VtsChannel},
    x509::csr::CertificationRequest,
    x509::name::Name,
};

use crate::integration_tests::common::{
    attach_app, direct_channel_pair, pump, pump_until, test_keypair,
};

#[test]
fn handshake_and_bidirectional_transfer() {
    let mut reactor = Reactor::new().expect("reactor");
    let (client, server) = direct_channel_pair(
        &reactor,
        ChannelOptions {
            keypair: Some(test_keypair()),
            ..ChannelOptions::default()
        },
        ChannelOptions {
            keypair: Some(test_keypair()),
            ..ChannelOptions::default()
        },
    );
    let client_app = attach_app(&client);
    let server_app = attach_app(&server);

    assert!(pump_until(&mut reactor, Duration::from_secs(10), || {
        client.is_running() && server.is_running()
    }));

    client_app
        .source
        .borrow_mut()
        .send(b"ping from client")
        .expect("send");
    server_app
        .source
        .borrow_mut()
        .send(b"pong from server")
        .expect("send");

    assert!(pump_until(&mut reactor, Duration::from_secs(10), || {
        server_app.sink.borrow().received() == b"ping from client"
            && client_app.sink.borrow().received() == b"pong from server"
    }));

    // Both sides have seen the other's key after a mutual handshake.
    assert!(client.peer_credentials().is_some());
    assert!(server.peer_credentials().is_some());
}

#[test]
fn large_transfer_crosses_buffer_limits() {
    let mut reactor = Reactor::new().expect("reactor");
    let (client, server) = direct_channel_pair(
        &reactor,
        ChannelOptions::default(),
        ChannelOptions {
            keypair: Some(test_keypair()),
            ..ChannelOptions::default()
        },
    );
    let client_app = attach_app(&client);
    let server_app = attach_app(&server);

    assert!(pump_until(&mut reactor, Duration::from_secs(10), || {
        client.is_running() && server.is_running()
    }));

    // Larger than every buffer bound and the frame size.
    let payload: Vec<u8> =
        (0..200_000usize).map(|i| (i * 31 % 251) as u8).collect();
    for chunk in payload.chunks(10_000) {
        client_app.source.borrow_mut().send(chunk).expect("send");
        pump(&mut reactor, 4);
    }

    assert!(pump_until(&mut reactor, Duration::from_secs(20), || {
        server_app.sink.borrow().received().len() == payload.len()
    }));
    assert_eq!(server_app.sink.borrow().received(), payload.as_slice());
}

#[test]
fn anonymous_client_fast_path() {
    let mut reactor = Reactor::new().expect("reactor");
    let (client, server) = direct_channel_pair(
        &reactor,
        // No client keypair: three-part keyseeds, no ServerFinished.
        ChannelOptions::default(),
        ChannelOptions {
            keypair: Some(test_keypair()),
            ..ChannelOptions::default()
        },
    );
    let client_app = attach_app(&client);
    let server_app = attach_app(&server);

    assert!(pump_until(&mut reactor, Duration::from_secs(10), || {
        client.is_running() && server.is_running()
    }));

    assert!(server.peer_credentials().is_none());
    assert!(client.peer_credentials().is_some());

    client_app
        .source
        .borrow_mut()
        .send(b"anonymous but encrypted")
        .expect("send");
    assert!(pump_until(&mut reactor, Duration::from_secs(10), || {
        server_app.sink.borrow().received() == b"anonymous but encrypted"
    }));
}

#[test]
fn certificate_credentials_are_authorized() {
    let mut reactor = Reactor::new().expect("reactor");

    let server_key = test_keypair();
    let mut subject = Name::new();
    subject.set_attr("common_name", "vts.server.example").expect("attr");
    let csr = CertificationRequest::create(&subject, &server_key, &[])
        .expect("csr");
    let server_cert = csr
        .self_sign_ca(
            1,
            Utc::now() + chrono::Duration::days(30),
            &server_key,
            None,
            None,
        )
        .expect("self sign");

    let mut auth = Auth::new(true, true, true);
    auth.add_root_certificate(server_cert.clone());

    let (client, server) = direct_channel_pair(
        &reactor,
        ChannelOptions {
            keypair: Some(test_keypair()),
            authorizer: Some(Rc::new(auth)),
            ..ChannelOptions::default()
        },
        ChannelOptions {
            keypair: Some(server_key),
            certificates: Some(vec![server_cert]),
            ..ChannelOptions::default()
        },
    );
    let _client_app = attach_app(&client);
    let _server_app = attach_app(&server);

    assert!(pump_until(&mut reactor, Duration::from_secs(10), || {
        client.is_running() && server.is_running()
    }));

    let creds = client.peer_credentials().expect("peer credentials");
    assert_eq!(creds.certificates.len(), 1);
    let identity = creds.identity.expect("peer identity");
    assert_eq!(identity.get_attr("common_name"), Some("vts.server.example"));
}

#[test]
fn untrusted_root_is_rejected() {
    let mut reactor = Reactor::new().expect("reactor");

    let server_key = test_keypair();
    let mut subject = Name::new();
    subject.set_attr("common_name", "rogue.example").expect("attr");
    let csr = CertificationRequest::create(&subject, &server_key, &[])
        .expect("csr");
    let server_cert = csr
        .self_sign_ca(
            2,
            Utc::now() + chrono::Duration::days(30),
            &server_key,
            None,
            None,
        )
        .expect("self sign");

    // Trust anchor differs from what the server presents.
    let other_key = test_keypair();
    let mut other_subject = Name::new();
    other_subject.set_attr("common_name", "trusted.example").expect("attr");
    let other_csr = CertificationRequest::create(&other_subject, &other_key, &[])
        .expect("csr");
    let trusted_root = other_csr
        .self_sign_ca(
            3,
            Utc::now() + chrono::Duration::days(30),
            &other_key,
            None,
            None,
        )
        .expect("self sign");

    let mut auth = Auth::new(true, true, true);
    auth.add_root_certificate(trusted_root);

    let (client, server) = direct_channel_pair(
        &reactor,
        ChannelOptions {
            keypair: Some(test_keypair()),
            authorizer: Some(Rc::new(auth)),
            ..ChannelOptions::default()
        },
        ChannelOptions {
            keypair: Some(server_key),
            certificates: Some(vec![server_cert]),
            ..ChannelOptions::default()
        },
    );
    let client_app = attach_app(&client);
    let _server_app = attach_app(&server);

    assert!(pump_until(&mut reactor, Duration::from_secs(10), || {
        client.is_aborted()
    }));
    assert!(!client.is_running());
    assert!(client_app.sink.borrow().is_aborted());
}

// ---------------------------------------------------------------------------
// A ciphertext tap between the bridges, for tamper and replay tests.

struct TapState {
    upstream: Option<ProducerRef>,
    inner: Option<ConsumerRef>,
    forward: Rc<ByteBuf>,
    flip_next: bool,
    recording: bool,
    recorded: Vec<u8>,
}

struct TapConsumer {
    state: Rc<RefCell<TapState>>,
}

struct TapProducer {
    state: Rc<RefCell<TapState>>,
}

impl TapState {
    fn forward_pending(&mut self) -> Result<i64> {
        let Some(inner) = self.inner.clone() else {
            return Ok(0);
        };
        inner.borrow_mut().consume(&self.forward, UNBOUNDED)
    }
}

impl ByteConsumer for TapConsumer {
    fn consume(&mut self, data: &ByteBuf, _clim: i64) -> Result<i64> {
        let mut st = self.state.borrow_mut();
        let mut bytes = data.pop_all();
        if st.flip_next && !bytes.is_empty() {
            st.flip_next = false;
            let last = bytes.len() - 1;
            bytes[last] ^= 0x01;
        }
        if st.recording {
            st.recorded.extend_from_slice(&bytes);
        }
        st.forward.append_slice(&bytes);
        st.forward_pending()
    }

    fn end_consume(&mut self, clean: bool) {
        let inner = self.state.borrow().inner.clone();
        if let Some(inner) = inner {
            inner.borrow_mut().end_consume(clean);
        }
    }

    fn abort(&mut self) {
        let inner = self.state.borrow_mut().inner.take();
        if let Some(inner) = inner {
            inner.borrow_mut().abort();
        }
    }

    fn set_producer(&mut self, producer: ProducerRef) -> Result<()> {
        self.state.borrow_mut().upstream = Some(producer);
        Ok(())
    }

    fn clear_producer(&mut self) {
        self.state.borrow_mut().upstream = None;
    }

    fn producer(&self) -> Option<ProducerRef> {
        self.state.borrow().upstream.clone()
    }
}

impl ByteProducer for TapProducer {
    fn can_produce(&mut self, limit: i64) {
        let upstream = self.state.borrow().upstream.clone();
        if let Some(upstream) = upstream {
            upstream.borrow_mut().can_produce(limit);
        }
    }

    fn abort(&mut self) {
        let upstream = self.state.borrow_mut().upstream.take();
        if let Some(upstream) = upstream {
            upstream.borrow_mut().abort();
        }
    }

    fn set_consumer(&mut self, consumer: ConsumerRef) -> Result<()> {
        self.state.borrow_mut().inner = Some(consumer);
        Ok(())
    }

    fn clear_consumer(&mut self) {
        self.state.borrow_mut().inner = None;
    }

    fn consumer(&self) -> Option<ConsumerRef> {
        self.state.borrow().inner.clone()
    }
}

/// Client/server pair with a tap on the client-to-server ciphertext
/// path.
fn tapped_pair(
    reactor: &Reactor,
) -> (VtsChannel, VtsChannel, Rc<RefCell<TapState>>) {
    let local = reactor.local();
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

    let state = Rc::new(RefCell::new(TapState {
        upstream: None,
        inner: None,
        forward: Rc::new(ByteBuf::new()),
        flip_next: false,
        recording: false,
        recorded: Vec::new(),
    }));
    let tap_consumer: ConsumerRef = Rc::new(RefCell::new(TapConsumer {
        state: state.clone(),
    }));
    let tap_producer: ProducerRef = Rc::new(RefCell::new(TapProducer {
        state: state.clone(),
    }));

    link(&tap_consumer, &client.cipher_produce).expect("link tap in");
    link(&server.cipher_consume, &tap_producer).expect("link tap out");
    link(&client.cipher_consume, &server.cipher_produce).expect("link s->c");

    (client, server, state)
}

#[test]
fn tampered_frame_aborts_receiver() {
    let mut reactor = Reactor::new().expect("reactor");
    let (client, server, tap) = tapped_pair(&reactor);
    let client_app = attach_app(&client);
    let server_app = attach_app(&server);

    assert!(pump_until(&mut reactor, Duration::from_secs(10), || {
        client.is_running() && server.is_running()
    }));

    tap.borrow_mut().flip_next = true;
    client_app
        .source
        .borrow_mut()
        .send(b"this frame gets flipped")
        .expect("send");

    assert!(pump_until(&mut reactor, Duration::from_secs(10), || {
        server.is_aborted()
    }));
    // The tampered plaintext never reached the application.
    assert!(server_app.sink.borrow().received().is_empty());
    assert!(server_app.sink.borrow().is_aborted());
}

#[test]
fn replayed_frame_aborts_receiver() {
    let mut reactor = Reactor::new().expect("reactor");
    let (client, server, tap) = tapped_pair(&reactor);
    let client_app = attach_app(&client);
    let server_app = attach_app(&server);

    assert!(pump_until(&mut reactor, Duration::from_secs(10), || {
        client.is_running() && server.is_running()
    }));

    tap.borrow_mut().recording = true;
    client_app
        .source
        .borrow_mut()
        .send(b"frame to be replayed")
        .expect("send");

    assert!(pump_until(&mut reactor, Duration::from_secs(10), || {
        server_app.sink.borrow().received() == b"frame to be replayed"
    }));

    // Re-inject the recorded ciphertext: the implicit counter has
    // moved on, so the MAC cannot match again.
    {
        let mut st = tap.borrow_mut();
        st.recording = false;
        let recorded = std::mem::take(&mut st.recorded);
        assert!(!recorded.is_empty());
        st.forward.append_slice(&recorded);
        let _ = st.forward_pending();
    }

    assert!(pump_until(&mut reactor, Duration::from_secs(10), || {
        server.is_aborted()
    }));
    assert_eq!(server_app.sink.borrow().received(), b"frame to be replayed");
}

// ---------------------------------------------------------------------------
// Back-pressure: a consumer granting credit in small steps.

struct StingySink {
    received: Vec<u8>,
    producer: Option<ProducerRef>,
    consumed: i64,
    granted: i64,
    step: i64,
}

impl ByteConsumer for StingySink {
    fn consume(&mut self, data: &ByteBuf, _clim: i64) -> Result<i64> {
        let allowance = self.granted - self.consumed;
        assert!(
            allowance >= 0,
            "producer delivered beyond the granted credit"
        );
        let take = (data.len() as i64).min(allowance).max(0) as usize;
        let bytes = data.pop(take);
        self.consumed += bytes.len() as i64;
        self.received.extend_from_slice(&bytes);
        self.granted = self.consumed + self.step;
        Ok(self.granted)
    }

    fn end_consume(&mut self, _clean: bool) {}

    fn abort(&mut self) {
        self.producer = None;
    }

    fn set_producer(&mut self, producer: ProducerRef) -> Result<()> {
        self.producer = Some(producer);
        Ok(())
    }

    fn clear_producer(&mut self) {
        self.producer = None;
    }

    fn producer(&self) -> Option<ProducerRef> {
        self.producer.clone()
    }

    fn on_attached(&mut self) {
        self.granted = self.consumed + self.step;
        let lim = self.granted;
        if let Some(producer) = self.producer.clone() {
            producer.borrow_mut().can_produce(lim);
        }
    }
}

#[test]
fn producer_respects_small_credit_steps() {
    let mut reactor = Reactor::new().expect("reactor");
    let (client, server) = direct_channel_pair(
        &reactor,
        ChannelOptions::default(),
        ChannelOptions {
            keypair: Some(test_keypair()),
            ..ChannelOptions::default()
        },
    );
    let client_app = attach_app(&client);

    let sink = Rc::new(RefCell::new(StingySink {
        received: Vec::new(),
        producer: None,
        consumed: 0,
        granted: 0,
        step: 17,
    }));
    let sink_ref: ConsumerRef = sink.clone();
    link(&sink_ref, &server.plain_produce).expect("link sink");

    assert!(pump_until(&mut reactor, Duration::from_secs(10), || {
        client.is_running() && server.is_running()
    }));

    let payload: Vec<u8> = (0..2000usize).map(|i| (i % 256) as u8).collect();
    client_app.source.borrow_mut().send(&payload).expect("send");

    assert!(pump_until(&mut reactor, Duration::from_secs(20), || {
        sink.borrow().received.len() == payload.len()
    }));
    assert_eq!(sink.borrow().received, payload);
}

#[test]
fn handshake_timeout_aborts_stalled_channel() {
    let mut reactor = Reactor::new().expect("reactor");
    let local = reactor.local();
    // No cipher side attached: the handshake can never progress.
    let client = VtsChannel::client(
        &local,
        ChannelOptions {
            keypair: Some(test_keypair()),
            ..ChannelOptions::default()
        },
    )
    .expect("client channel");
    let _app = attach_app(&client);
    client.set_handshake_timeout(Duration::from_millis(50));

    assert!(pump_until(&mut reactor, Duration::from_secs(5), || {
        client.is_aborted()
    }));
    assert!(!client.is_running());
}

#[test]
fn disarmed_handshake_timeout_is_harmless() {
    let mut reactor = Reactor::new().expect("reactor");
    let (client, server) = direct_channel_pair(
        &reactor,
        ChannelOptions::default(),
        ChannelOptions {
            keypair: Some(test_keypair()),
            ..ChannelOptions::default()
        },
    );
    let _client_app = attach_app(&client);
    let _server_app = attach_app(&server);
    let timeout = client.set_handshake_timeout(Duration::from_secs(30));

    assert!(pump_until(&mut reactor, Duration::from_secs(10), || {
        client.is_running() && server.is_running()
    }));
    timeout.cancel();
    assert!(!client.is_aborted());
}

#[test]
fn rejecting_control_hook_aborts() {
    // An Error pathway sanity check: a client key the server's
    // approval hook rejects tears the channel down.
    let mut reactor = Reactor::new().expect("reactor");
    let local = reactor.local();
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
            approve_key: Some(Rc::new(|_key| false)),
            ..ChannelOptions::default()
        },
    )
    .expect("server channel");
    link(&server.cipher_consume, &client.cipher_produce).expect("link c->s");
    link(&client.cipher_consume, &server.cipher_produce).expect("link s->c");
    let _client_app = attach_app(&client);
    let server_app = attach_app(&server);

    assert!(pump_until(&mut reactor, Duration::from_secs(10), || {
        server.is_aborted()
    }));
    assert!(!server.is_running());
    assert!(server_app.sink.borrow().is_aborted());
}
