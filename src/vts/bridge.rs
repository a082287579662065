// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Channel bridge between a plaintext and a ciphertext byte flow.
//!
//! Four endpoints per bridge: `plain_consume` and `plain_produce` face
//! the application, `cipher_consume` and `cipher_produce` face the
//! wire. The ciphertext side performs the protocol hello and handshake
//! before plaintext conversion starts; any protocol, crypto or
//! authorization failure cascades into an abort of all four endpoints.
//!
//! All bridge logic runs on the reactor thread. Methods follow one
//! rule: collect state under a short borrow, drop it, then call into
//! other endpoints.

use std::{
    cell::RefCell,
    rc::{Rc, Weak},
    time::Duration,
};

use tracing::{debug, warn};

use crate::{
    codec::hsvalue::{HsReader, HsWriter},
    crypto::{
        auth::PeerAuthorizer,
        block::{CipherAlgo, CipherMode},
        hashes::HashKind,
        message::{MessageDecrypter, MessageEncrypter, PadGenerator},
        rsa::RsaKey,
    },
    error::{Error, Result},
    io::{
        ByteConsumer, ByteProducer, ConsumerRef, Control, ControlResult,
        PeerCredentials, ProducerRef, UNBOUNDED, buf::ByteBuf, credit,
    },
    reactor::{CallHandle, LocalReactor},
    vts::handshake::{
        self, Credentials, DirectionKeys, PROTO_HELLO, PROTO_MAXLEN, gen_keys,
    },
    x509::{X509Format, cert::Certificate, name::Name},
};

/// Channel preference lists and resource limits.
#[derive(Clone)]
pub struct VtsConfig {
    pub hmac_hashes: Vec<HashKind>,
    pub ciphers: Vec<(CipherAlgo, Vec<CipherMode>)>,
    pub hashes: Vec<HashKind>,
    pub pub_ciphers: Vec<String>,
    /// Read-buffer bound per direction; negative for unbounded.
    pub rbuf_len: i64,
    /// Largest single downstream write; negative for unbounded.
    pub max_write: i64,
    /// Bound on a single handshake message.
    pub hshake_lim: Option<u64>,
    /// Bound on accepted peer key width, in bytes.
    pub max_keylen: Option<usize>,
    pub padding: PadGenerator,
}

impl Default for VtsConfig {
    fn default() -> Self {
        VtsConfig {
            hmac_hashes: vec![HashKind::Sha256],
            ciphers: vec![
                (CipherAlgo::Aes256, vec![CipherMode::Cbc, CipherMode::Ofb]),
                (CipherAlgo::Aes128, vec![CipherMode::Cbc, CipherMode::Ofb]),
            ],
            hashes: vec![HashKind::Sha1],
            pub_ciphers: vec!["rsa".to_string()],
            rbuf_len: 0x4000,
            max_write: 0x4000,
            hshake_lim: Some(16384),
            max_keylen: Some(4096 / 8),
            padding: PadGenerator::Zero,
        }
    }
}

/// Construction inputs for one channel end.
#[derive(Default)]
pub struct ChannelOptions {
    pub keypair: Option<RsaKey>,
    pub identity: Option<Name>,
    pub certificates: Option<Vec<Certificate>>,
    pub authorizer: Option<Rc<dyn PeerAuthorizer>>,
    /// Early approval hook for the bare peer public key.
    pub approve_key: Option<Rc<dyn Fn(&RsaKey) -> bool>>,
    pub config: VtsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HsStep {
    AwaitServerHello,
    AwaitServerFinished,
    AwaitClientHello,
    AwaitClientKeyX,
}

pub(crate) struct VtsShared {
    pub(crate) reactor: LocalReactor,
    pub(crate) role: Role,
    pub(crate) config: VtsConfig,
    pub(crate) keypair: Option<RsaKey>,
    pub(crate) identity: Option<Name>,
    pub(crate) certificates: Option<Vec<Certificate>>,
    pub(crate) authorizer: Option<Rc<dyn PeerAuthorizer>>,
    pub(crate) approve_key: Option<Rc<dyn Fn(&RsaKey) -> bool>>,

    // Negotiated handshake outcome.
    pub(crate) hmac_kind: Option<HashKind>,
    pub(crate) cipher: Option<(CipherAlgo, CipherMode)>,
    pub(crate) hash_kind: Option<HashKind>,
    pub(crate) rand_c: Vec<u8>,
    pub(crate) rand_s: Vec<u8>,
    pub(crate) srand_c: Vec<u8>,
    pub(crate) srand_s: Vec<u8>,
    pub(crate) peer_pub_key: Option<RsaKey>,
    pub(crate) peer_identity: Option<Name>,
    pub(crate) peer_certificates: Option<Vec<Certificate>>,
    pub(crate) peer_max_keylen: Option<u64>,
    pub(crate) peer_hshake_lim: Option<u64>,

    pub(crate) msg_encrypter: Option<MessageEncrypter>,
    pub(crate) msg_decrypter: Option<MessageDecrypter>,

    // Protocol hello state.
    pub(crate) have_protocol: bool,
    pub(crate) proto_data: Vec<u8>,
    pub(crate) proto_send: Option<Rc<ByteBuf>>,
    pub(crate) can_send_proto: bool,

    // Handshake driving state.
    pub(crate) handshaking: bool,
    pub(crate) end_handshaking: bool,
    pub(crate) hs_reader: Option<HsReader>,
    pub(crate) hs_writer: Option<HsWriter>,
    pub(crate) hs_step: Option<HsStep>,

    // Plaintext consumer flow.
    pub(crate) pc_producer: Option<ProducerRef>,
    pub(crate) pc_consumed: i64,
    pub(crate) pc_consume_lim: i64,
    pub(crate) pc_eod: bool,
    pub(crate) pc_eod_clean: bool,
    pub(crate) pc_aborted: bool,
    pub(crate) pc_rbuf: Rc<ByteBuf>,

    // Plaintext producer flow.
    pub(crate) pp_consumer: Option<ConsumerRef>,
    pub(crate) pp_produced: i64,
    pub(crate) pp_produce_lim: i64,
    pub(crate) pp_sent_eod: bool,
    pub(crate) pp_wbuf: Rc<ByteBuf>,

    // Ciphertext consumer flow.
    pub(crate) cc_producer: Option<ProducerRef>,
    pub(crate) cc_consumed: i64,
    pub(crate) cc_consume_lim: i64,
    pub(crate) cc_eod: bool,
    pub(crate) cc_eod_clean: bool,
    pub(crate) cc_aborted: bool,
    pub(crate) cc_rbuf: Rc<ByteBuf>,

    // Ciphertext producer flow.
    pub(crate) cp_consumer: Option<ConsumerRef>,
    pub(crate) cp_produced: i64,
    pub(crate) cp_produce_lim: i64,
    pub(crate) cp_sent_eod: bool,
    pub(crate) cp_wbuf: Rc<ByteBuf>,

    pub(crate) pc_iface: Option<Weak<RefCell<dyn ByteConsumer>>>,
    pub(crate) pp_iface: Option<Weak<RefCell<dyn ByteProducer>>>,
    pub(crate) cc_iface: Option<Weak<RefCell<dyn ByteConsumer>>>,
    pub(crate) cp_iface: Option<Weak<RefCell<dyn ByteProducer>>>,
}

impl VtsShared {
    pub(crate) fn negotiated(
        &self,
    ) -> Result<(HashKind, (CipherAlgo, CipherMode), HashKind)> {
        match (self.hmac_kind, self.cipher, self.hash_kind) {
            (Some(hmac), Some(cipher), Some(hash)) => Ok((hmac, cipher, hash)),
            _ => Err(Error::protocol("handshake parameters not negotiated")),
        }
    }

    /// End-of-data reached on the plaintext producer: ciphertext intake
    /// finished and every buffered stage drained.
    fn pp_eod(&self) -> bool {
        self.cc_eod
            && self.cc_rbuf.is_empty()
            && self.pp_wbuf.is_empty()
            && !self
                .msg_decrypter
                .as_ref()
                .is_some_and(MessageDecrypter::has_data)
    }

    /// End-of-data reached on the ciphertext producer.
    fn cp_eod(&self) -> bool {
        self.pc_eod && self.pc_rbuf.is_empty() && self.cp_wbuf.is_empty()
    }

    fn pc_update_lim(&mut self) {
        if self.pc_producer.is_some()
            && !self.pc_eod
            && !self.handshaking
            && self.have_protocol
        {
            let max_add = credit(self.pc_rbuf.len() as i64, &[self.config.rbuf_len]);
            self.pc_consume_lim = if max_add >= 0 {
                self.pc_consumed + max_add
            } else {
                UNBOUNDED
            };
        }
    }

    fn cc_update_lim(&mut self) {
        if self.cc_producer.is_none() || self.cc_eod {
            return;
        }
        // Hold the limit while the plaintext write buffer is backed up
        // past the cipher read-buffer bound.
        if self.have_protocol
            && !self.handshaking
            && self.pp_produce_lim >= 0
            && self.config.rbuf_len >= 0
            && self.pp_wbuf.len() as i64 >= self.config.rbuf_len
        {
            return;
        }
        let max_add = credit(self.cc_rbuf.len() as i64, &[self.config.rbuf_len]);
        self.cc_consume_lim = if max_add >= 0 {
            self.cc_consumed + max_add
        } else {
            UNBOUNDED
        };
    }

    pub(crate) fn own_credentials(&self) -> Result<Option<Credentials>> {
        if let Some(identity) = &self.identity {
            return Ok(Some(Credentials::Identity(identity.encode_der()?)));
        }
        if let Some(certs) = &self.certificates {
            let mut ders = Vec::with_capacity(certs.len());
            for cert in certs {
                ders.push(cert.export(X509Format::Der)?);
            }
            return Ok(Some(Credentials::CertChain(ders)));
        }
        Ok(None)
    }

    /// Installs the framed-message ciphers from the negotiated secrets.
    pub(crate) fn install_encrypters(&mut self, with_server_secret: bool) -> Result<()> {
        let (hmac, cipher, hash) = self.negotiated()?;
        let (s_seed, c_seed) = self.keyseeds(with_server_secret);
        let (c_keys, s_keys) = gen_keys(hmac, cipher.0, &s_seed, &c_seed);
        let (enc_keys, dec_keys): (DirectionKeys, DirectionKeys) = match self.role {
            Role::Client => (c_keys, s_keys),
            Role::Server => (s_keys, c_keys),
        };
        let enc_transform =
            cipher.0.encrypter(&enc_keys.key, &enc_keys.iv, cipher.1)?;
        let dec_transform =
            cipher.0.decrypter(&dec_keys.key, &dec_keys.iv, cipher.1)?;
        self.msg_encrypter = Some(MessageEncrypter::new(
            Box::new(enc_transform),
            hash,
            enc_keys.mac,
            self.config.padding,
        ));
        self.msg_decrypter = Some(MessageDecrypter::new(
            Box::new(dec_transform),
            hash,
            dec_keys.mac,
        ));
        Ok(())
    }

    fn keyseeds(&self, with_server_secret: bool) -> (Vec<u8>, Vec<u8>) {
        let mut s_seed = self.rand_s.clone();
        s_seed.extend_from_slice(&self.rand_c);
        let mut c_seed = self.rand_c.clone();
        c_seed.extend_from_slice(&self.rand_s);
        if with_server_secret {
            s_seed.extend_from_slice(&self.srand_s);
            s_seed.extend_from_slice(&self.srand_c);
            c_seed.extend_from_slice(&self.srand_c);
            c_seed.extend_from_slice(&self.srand_s);
        } else {
            s_seed.extend_from_slice(&self.srand_c);
            c_seed.extend_from_slice(&self.srand_c);
        }
        (s_seed, c_seed)
    }
}

pub(crate) use crate::utils::random_bytes;

pub(crate) type Vts = Rc<RefCell<VtsShared>>;

fn sched(reactor: &LocalReactor, vts: &Vts, f: fn(&Vts)) {
    let vts = vts.clone();
    let _ = reactor.schedule(Duration::ZERO, move || f(&vts));
}

pub(crate) fn sched_dismantle(reactor: &LocalReactor, vts: &Vts) {
    sched(reactor, vts, error_dismantle);
}

/// Aborts every attached party and drops all bridge buffers.
pub(crate) fn error_dismantle(vts: &Vts) {
    let (producers, consumers) = {
        let st = vts.borrow();
        (
            [st.cc_producer.clone(), st.pc_producer.clone()],
            [st.cp_consumer.clone(), st.pp_consumer.clone()],
        )
    };
    for producer in producers.into_iter().flatten() {
        producer.borrow_mut().abort();
    }
    for consumer in consumers.into_iter().flatten() {
        consumer.borrow_mut().abort();
    }
    pc_abort(vts);
    cc_abort(vts);
}

// ---------------------------------------------------------------------------
// Plaintext consumer flow

pub(crate) fn pc_consume(vts: &Vts, data: &ByteBuf, clim: i64) -> Result<i64> {
    {
        let mut st = vts.borrow_mut();
        if st.pc_eod {
            return Err(Error::resource("consumer already received end-of-data"));
        }
        if st.pc_producer.is_none() {
            return Err(Error::resource("no connected producer"));
        }
        if data.is_empty() {
            return Err(Error::resource("no data to consume"));
        }
        let mut max_cons = credit(st.pc_consumed, &[st.pc_consume_lim]);
        if max_cons == 0 {
            return Err(Error::resource("consume limit exceeded"));
        }
        if clim >= 0 {
            max_cons = if max_cons < 0 { clim } else { max_cons.min(clim) };
        }
        let take = if max_cons < 0 {
            data.len()
        } else {
            data.len().min(max_cons as usize)
        };
        let chunks = data.pop_list(take);
        let moved: usize = chunks.iter().map(bytes::Bytes::len).sum();
        st.pc_rbuf.append_list(chunks);
        st.pc_consumed += moved as i64;
    }

    cp_do_produce(vts);

    let mut st = vts.borrow_mut();
    st.pc_update_lim();
    Ok(st.pc_consume_lim)
}

pub(crate) fn pc_end_consume(vts: &Vts, clean: bool) {
    let (has_cp, reactor) = {
        let mut st = vts.borrow_mut();
        if st.pc_eod {
            return;
        }
        st.pc_eod = true;
        st.pc_eod_clean = clean;
        (st.cp_consumer.is_some(), st.reactor.clone())
    };
    if has_cp {
        cp_do_produce(vts);
        // Once the backlog flushed, a second pass propagates the end.
        sched(&reactor, vts, cp_do_produce);
    } else {
        pc_abort(vts);
    }
}

pub(crate) fn pc_abort(vts: &Vts) {
    let taken = {
        let mut st = vts.borrow_mut();
        if st.pc_aborted {
            None
        } else {
            st.pc_aborted = true;
            st.pc_eod = true;
            st.pc_rbuf.clear();
            st.msg_encrypter = None;
            st.cp_wbuf.clear();
            st.pc_consumed = 0;
            st.pc_consume_lim = 0;
            st.cp_produced = 0;
            st.cp_produce_lim = 0;
            Some((st.cp_consumer.take(), st.pc_producer.take()))
        }
    };
    let Some((cp_consumer, pc_producer)) = taken else {
        return;
    };
    if let Some(consumer) = cp_consumer {
        consumer.borrow_mut().abort();
        consumer.borrow_mut().clear_producer();
    }
    if let Some(producer) = pc_producer {
        producer.borrow_mut().abort();
        producer.borrow_mut().clear_consumer();
    }
}

fn pc_send_limit(vts: &Vts) {
    let target = {
        let st = vts.borrow();
        st.pc_producer.clone().map(|p| (p, st.pc_consume_lim))
    };
    if let Some((producer, lim)) = target {
        producer.borrow_mut().can_produce(lim);
    }
}

/// Opens the plaintext intake once the handshake has completed.
pub(crate) fn enable_plaintext(vts: &Vts) {
    let (changed, reactor) = {
        let mut st = vts.borrow_mut();
        let reactor = st.reactor.clone();
        if st.pc_producer.is_some() && !st.pc_eod {
            let old = st.pc_consume_lim;
            st.pc_update_lim();
            (st.pc_consume_lim != old, reactor)
        } else {
            (false, reactor)
        }
    };
    if changed {
        sched(&reactor, vts, pc_send_limit);
    }
}

// ---------------------------------------------------------------------------
// Plaintext producer flow

pub(crate) fn pp_can_produce(vts: &Vts, limit: i64) {
    let (raised, reactor) = {
        let mut st = vts.borrow_mut();
        let reactor = st.reactor.clone();
        if st.pp_consumer.is_none() {
            return;
        }
        let raised = if limit < 0 {
            if st.pp_produce_lim >= 0 {
                st.pp_produce_lim = UNBOUNDED;
                true
            } else {
                false
            }
        } else if st.pp_produce_lim >= 0 && st.pp_produce_lim < limit {
            st.pp_produce_lim = limit;
            true
        } else {
            false
        };
        (raised, reactor)
    };
    if raised {
        sched(&reactor, vts, pp_do_produce);
    }
}

pub(crate) fn pp_do_produce(vts: &Vts) {
    let (consumer, wbuf, max_write, old_lim, reactor) = {
        let mut st = vts.borrow_mut();
        let Some(consumer) = st.pp_consumer.clone() else {
            return;
        };
        let reactor = st.reactor.clone();
        if st.pp_eod() {
            if !st.pp_sent_eod {
                st.pp_sent_eod = true;
                let clean = st.cc_eod_clean;
                drop(st);
                consumer.borrow_mut().end_consume(clean);
            }
            return;
        }
        if st.pp_wbuf.is_empty() {
            return;
        }
        if st.pp_produce_lim >= 0 && st.pp_produce_lim <= st.pp_produced {
            return;
        }
        let mut max_write = credit(st.pp_produced, &[st.pp_produce_lim]);
        max_write = if max_write < 0 {
            st.config.max_write
        } else if st.config.max_write >= 0 {
            max_write.min(st.config.max_write)
        } else {
            max_write
        };
        (
            consumer,
            st.pp_wbuf.clone(),
            max_write,
            st.pp_produce_lim,
            reactor,
        )
    };

    if max_write == 0 {
        return;
    }
    let before = wbuf.len();
    let result = consumer.borrow_mut().consume(&wbuf, max_write);

    let (again, cc_changed) = {
        let mut st = vts.borrow_mut();
        match result {
            Ok(new_lim) => {
                st.pp_produce_lim = new_lim;
                st.pp_produced += (before - wbuf.len()) as i64;
            },
            Err(e) => {
                warn!("plaintext consumer failed: {e}");
                drop(st);
                cc_abort(vts);
                return;
            },
        }
        let again = st.pp_produce_lim != old_lim && !st.pp_wbuf.is_empty();
        let mut cc_changed = false;
        if st.cc_producer.is_some() && !st.cc_eod {
            let old_cc = st.cc_consume_lim;
            st.cc_update_lim();
            cc_changed = st.cc_consume_lim != old_cc;
        }
        (again, cc_changed)
    };
    if again {
        sched(&reactor, vts, pp_do_produce);
    }
    if cc_changed {
        sched(&reactor, vts, cc_send_limit);
    }
}

pub(crate) fn pp_abort(vts: &Vts) {
    cc_abort(vts);
}

// ---------------------------------------------------------------------------
// Ciphertext consumer flow

pub(crate) fn cc_consume(vts: &Vts, data: &ByteBuf, clim: i64) -> Result<i64> {
    let reactor = {
        let mut st = vts.borrow_mut();
        if st.cc_eod {
            return Err(Error::resource("consumer already received end-of-data"));
        }
        if st.cc_producer.is_none() {
            return Err(Error::resource("no connected producer"));
        }
        if data.is_empty() {
            return Err(Error::resource("no data to consume"));
        }
        let mut max_cons = credit(st.cc_consumed, &[st.cc_consume_lim]);
        if max_cons == 0 {
            return Err(Error::resource("consume limit exceeded"));
        }
        if clim >= 0 {
            max_cons = if max_cons < 0 { clim } else { max_cons.min(clim) };
        }
        let take = if max_cons < 0 {
            data.len()
        } else {
            data.len().min(max_cons as usize)
        };
        let chunks = data.pop_list(take);
        let moved: usize = chunks.iter().map(bytes::Bytes::len).sum();
        st.cc_rbuf.append_list(chunks);
        st.cc_consumed += moved as i64;
        st.reactor.clone()
    };

    let mut cipher_produce = false;
    let mut plain_produce = false;

    if !vts.borrow().have_protocol {
        cipher_produce = true;
        if let Err(e) = consume_protocol(vts) {
            sched_dismantle(&reactor, vts);
            return Err(e);
        }
    }

    let (handshaking, have_protocol) = {
        let st = vts.borrow();
        (st.handshaking, st.have_protocol)
    };
    if handshaking && have_protocol {
        cipher_produce = true;
        let outcome = {
            let mut st = vts.borrow_mut();
            if !st.cc_rbuf.is_empty() && st.hs_reader.is_some() {
                let rbuf = st.cc_rbuf.clone();
                let reader = st.hs_reader.as_mut().expect("reader checked above");
                match reader.read(&rbuf) {
                    Ok(true) => {
                        let reader =
                            st.hs_reader.take().expect("reader checked above");
                        Some(reader.result())
                    },
                    Ok(false) => None,
                    Err(e) => Some(Err(e)),
                }
            } else {
                None
            }
        };
        match outcome {
            Some(Ok(value)) => {
                let vts2 = vts.clone();
                let _ = reactor.schedule(Duration::ZERO, move || {
                    if let Err(e) = super::dispatch_handshake(&vts2, value) {
                        warn!("handshake failed: {e}");
                        error_dismantle(&vts2);
                    }
                });
            },
            Some(Err(e)) => {
                sched_dismantle(&reactor, vts);
                return Err(e);
            },
            None => {},
        }
    }

    let (handshaking, have_protocol) = {
        let st = vts.borrow();
        (st.handshaking, st.have_protocol)
    };
    if !handshaking && have_protocol {
        plain_produce = true;
        drain_ciphertext(vts)?;
    }

    if cipher_produce {
        sched(&reactor, vts, cp_do_produce);
    }
    if plain_produce {
        pp_do_produce(vts);
    }

    let mut st = vts.borrow_mut();
    st.cc_update_lim();
    Ok(st.cc_consume_lim)
}

/// Decrypts buffered ciphertext frames into the plaintext write
/// buffer. Runs from intake, and once more when the handshake
/// completes with frames already buffered behind the final message.
pub(crate) fn drain_ciphertext(vts: &Vts) -> Result<()> {
    let reactor = vts.borrow().reactor.clone();
    loop {
        let mut st = vts.borrow_mut();
        if st.handshaking || !st.have_protocol || st.cc_rbuf.is_empty() {
            break;
        }
        let rbuf = st.cc_rbuf.clone();
        let Some(dec) = st.msg_decrypter.as_mut() else {
            break;
        };
        let before = rbuf.len();
        let step = dec.read(&rbuf).and_then(|_| dec.done());
        match step {
            Err(_) => {
                drop(st);
                sched(&reactor, vts, cc_abort);
                return Err(Error::protocol("ciphertext decryption error"));
            },
            Ok(true) => {
                let plain = match dec.result() {
                    Ok(plain) => plain.to_vec(),
                    Err(_) => {
                        drop(st);
                        sched(&reactor, vts, cc_abort);
                        return Err(Error::protocol("ciphertext decryption error"));
                    },
                };
                let reset_ok = dec.reset().is_ok();
                st.pp_wbuf.append_slice(&plain);
                if !reset_ok {
                    drop(st);
                    sched(&reactor, vts, cc_abort);
                    return Err(Error::protocol("ciphertext decryption error"));
                }
            },
            Ok(false) => {
                if rbuf.len() == before {
                    break;
                }
            },
        }
    }
    Ok(())
}

pub(crate) fn cc_end_consume(vts: &Vts, clean: bool) {
    let (has_pp, reactor) = {
        let mut st = vts.borrow_mut();
        if st.cc_eod {
            return;
        }
        st.cc_eod = true;
        st.cc_eod_clean = clean;
        (st.pp_consumer.is_some(), st.reactor.clone())
    };
    if has_pp {
        pp_do_produce(vts);
        sched(&reactor, vts, pp_do_produce);
    } else {
        cc_abort(vts);
    }
}

pub(crate) fn cc_abort(vts: &Vts) {
    let taken = {
        let mut st = vts.borrow_mut();
        if st.cc_aborted {
            None
        } else {
            st.cc_aborted = true;
            st.cc_eod = true;
            st.pp_wbuf.clear();
            st.msg_decrypter = None;
            st.cc_rbuf.clear();
            st.cc_consumed = 0;
            st.cc_consume_lim = 0;
            st.pp_produced = 0;
            st.pp_produce_lim = 0;
            Some((st.pp_consumer.take(), st.cc_producer.take()))
        }
    };
    let Some((pp_consumer, cc_producer)) = taken else {
        return;
    };
    if let Some(consumer) = pp_consumer {
        consumer.borrow_mut().abort();
        consumer.borrow_mut().clear_producer();
    }
    if let Some(producer) = cc_producer {
        producer.borrow_mut().abort();
        producer.borrow_mut().clear_consumer();
    }
}

fn cc_send_limit(vts: &Vts) {
    let target = {
        let st = vts.borrow();
        st.cc_producer.clone().map(|p| (p, st.cc_consume_lim))
    };
    if let Some((producer, lim)) = target {
        producer.borrow_mut().can_produce(lim);
    }
}

// ---------------------------------------------------------------------------
// Ciphertext producer flow

pub(crate) fn cp_can_produce(vts: &Vts, limit: i64) {
    let (raised, reactor) = {
        let mut st = vts.borrow_mut();
        let reactor = st.reactor.clone();
        if st.cp_consumer.is_none() {
            return;
        }
        let raised = if limit < 0 {
            if st.cp_produce_lim >= 0 {
                st.cp_produce_lim = UNBOUNDED;
                true
            } else {
                false
            }
        } else if st.cp_produce_lim >= 0 && st.cp_produce_lim < limit {
            st.cp_produce_lim = limit;
            true
        } else {
            false
        };
        (raised, reactor)
    };
    if raised {
        sched(&reactor, vts, cp_do_produce);
    }
}

fn cp_write_budget(st: &VtsShared) -> i64 {
    let mut max_write = credit(st.cp_produced, &[st.cp_produce_lim]);
    max_write = if max_write < 0 {
        st.config.max_write
    } else if st.config.max_write >= 0 {
        max_write.min(st.config.max_write)
    } else {
        max_write
    };
    max_write
}

pub(crate) fn cp_do_produce(vts: &Vts) {
    let reactor = vts.borrow().reactor.clone();

    // End-of-data propagation toward the wire.
    {
        let mut st = vts.borrow_mut();
        let Some(consumer) = st.cp_consumer.clone() else {
            return;
        };
        if st.cp_eod() {
            if !st.cp_sent_eod {
                st.cp_sent_eod = true;
                let clean = st.pc_eod_clean;
                drop(st);
                consumer.borrow_mut().end_consume(clean);
            }
            return;
        }
        if st.cp_produce_lim >= 0 && st.cp_produce_lim <= st.cp_produced {
            return;
        }
    }

    // Phase 1: protocol hello.
    let proto = {
        let st = vts.borrow();
        if let (Some(proto_send), true) = (st.proto_send.clone(), st.can_send_proto)
        {
            let consumer = st.cp_consumer.clone().expect("checked above");
            Some((consumer, proto_send, cp_write_budget(&st)))
        } else {
            None
        }
    };
    if let Some((consumer, proto_send, max_write)) = proto {
        if max_write != 0 && !proto_send.is_empty() {
            let before = proto_send.len();
            let result = consumer.borrow_mut().consume(&proto_send, max_write);
            let mut st = vts.borrow_mut();
            match result {
                Ok(new_lim) => {
                    st.cp_produce_lim = new_lim;
                    st.cp_produced += (before - proto_send.len()) as i64;
                    if proto_send.is_empty() {
                        st.proto_send = None;
                        drop(st);
                        // The handshake writer may already be pending.
                        sched(&reactor, vts, cp_do_produce);
                    }
                },
                Err(e) => {
                    warn!("ciphertext consumer failed: {e}");
                    drop(st);
                    sched_dismantle(&reactor, vts);
                },
            }
        }
        return;
    }

    // Phase 2: handshake messages.
    let (handshaking, have_protocol) = {
        let st = vts.borrow();
        (st.handshaking, st.have_protocol)
    };
    if handshaking && have_protocol {
        let step = {
            let mut st = vts.borrow_mut();
            if st.hs_writer.is_some() {
                let max_write = cp_write_budget(&st);
                let consumer = st.cp_consumer.clone().expect("checked above");
                let wbuf = st.cp_wbuf.clone();
                let chunk_len = if max_write != 0 {
                    let writer = st.hs_writer.as_mut().expect("writer checked");
                    let chunk_max = if max_write < 0 {
                        usize::MAX
                    } else {
                        max_write as usize
                    };
                    let chunk = writer.write(chunk_max).to_vec();
                    wbuf.append_slice(&chunk);
                    chunk.len()
                } else {
                    0
                };
                Some((consumer, wbuf, chunk_len))
            } else {
                None
            }
        };
        if let Some((consumer, wbuf, chunk_len)) = step {
            if chunk_len != 0 || !wbuf.is_empty() {
                let result = consumer.borrow_mut().consume(&wbuf, UNBOUNDED);
                let mut st = vts.borrow_mut();
                match result {
                    Ok(new_lim) => {
                        st.cp_produce_lim = new_lim;
                        st.cp_produced += chunk_len as i64;
                    },
                    Err(e) => {
                        warn!("ciphertext consumer failed: {e}");
                        drop(st);
                        sched_dismantle(&reactor, vts);
                        return;
                    },
                }
                if !st.cp_wbuf.is_empty() {
                    drop(st);
                    warn!("consume limit violation during handshake");
                    sched_dismantle(&reactor, vts);
                    return;
                }
            }
            let finished = {
                let mut st = vts.borrow_mut();
                let done = st
                    .hs_writer
                    .as_ref()
                    .is_some_and(HsWriter::done);
                if done {
                    st.hs_writer = None;
                    if st.end_handshaking {
                        st.handshaking = false;
                        true
                    } else {
                        false
                    }
                } else {
                    false
                }
            };
            if finished {
                debug!("handshake completed");
                enable_plaintext(vts);
            }
        }
    }

    // Phase 3: running plaintext conversion.
    let (handshaking, have_protocol) = {
        let st = vts.borrow();
        (st.handshaking, st.have_protocol)
    };
    if !handshaking && have_protocol {
        loop {
            enum Work {
                Flush(ConsumerRef, Rc<ByteBuf>, i64),
                Encrypt,
            }
            let work = {
                let st = vts.borrow();
                if st.cp_consumer.is_none() {
                    break;
                }
                if st.cp_wbuf.is_empty() && st.pc_rbuf.is_empty() {
                    break;
                }
                if st.cp_produce_lim >= 0 && st.cp_produce_lim <= st.cp_produced {
                    break;
                }
                if !st.cp_wbuf.is_empty() {
                    let max_write = cp_write_budget(&st);
                    if max_write == 0 {
                        break;
                    }
                    Work::Flush(
                        st.cp_consumer.clone().expect("checked above"),
                        st.cp_wbuf.clone(),
                        max_write,
                    )
                } else {
                    Work::Encrypt
                }
            };
            match work {
                Work::Flush(consumer, wbuf, max_write) => {
                    let before = wbuf.len();
                    let result = consumer.borrow_mut().consume(&wbuf, max_write);
                    let mut st = vts.borrow_mut();
                    match result {
                        Ok(new_lim) => {
                            st.cp_produce_lim = new_lim;
                            st.cp_produced += (before - wbuf.len()) as i64;
                        },
                        Err(e) => {
                            warn!("ciphertext consumer failed: {e}");
                            drop(st);
                            sched_dismantle(&reactor, vts);
                            return;
                        },
                    }
                },
                Work::Encrypt => {
                    let mut st = vts.borrow_mut();
                    let take = st
                        .pc_rbuf
                        .len()
                        .min(crate::crypto::message::MAX_PLAINTEXT_LEN);
                    let data = st.pc_rbuf.pop(take);
                    let Some(enc) = st.msg_encrypter.as_mut() else {
                        break;
                    };
                    match enc.message(&data) {
                        Ok(msg) => st.cp_wbuf.append_slice(&msg),
                        Err(e) => {
                            warn!("message encryption failed: {e}");
                            drop(st);
                            sched(&reactor, vts, pc_abort);
                            return;
                        },
                    }
                },
            }
        }

        // Space may have opened for the plaintext producer.
        let changed = {
            let mut st = vts.borrow_mut();
            if st.pc_producer.is_some() && !st.pc_eod {
                let old = st.pc_consume_lim;
                st.pc_update_lim();
                st.pc_consume_lim != old
            } else {
                false
            }
        };
        if changed {
            sched(&reactor, vts, pc_send_limit);
        }
    }
}

pub(crate) fn cp_abort(vts: &Vts) {
    pc_abort(vts);
}

// ---------------------------------------------------------------------------
// Protocol hello intake

fn consume_protocol(vts: &Vts) -> Result<()> {
    let complete = {
        let mut st = vts.borrow_mut();
        while !st.cc_rbuf.is_empty() && st.proto_data.len() < PROTO_MAXLEN {
            let byte = st.cc_rbuf.pop(1);
            st.proto_data.extend_from_slice(&byte);
            if byte == b"\n" {
                break;
            }
        }
        if st.proto_data.last() != Some(&b'\n') {
            if st.proto_data.len() >= PROTO_MAXLEN {
                return Err(Error::protocol(format!(
                    "handshake protocol exceeded {PROTO_MAXLEN} byte limit"
                )));
            }
            return Ok(());
        }
        st.proto_data.clone()
    };

    handshake::check_hello(&complete)?;
    debug!("received protocol hello");
    {
        let mut st = vts.borrow_mut();
        st.have_protocol = true;
        st.can_send_proto = true;
        st.handshaking = true;
    }
    super::init_handshake(vts)
}

// ---------------------------------------------------------------------------
// Peer credential handling shared by both roles

/// Reconstructs and validates the peer's identity or certificate chain.
pub(crate) fn parse_id_or_certs(
    vts: &Vts,
    key: Option<&RsaKey>,
    credentials: Option<Credentials>,
) -> Result<(Option<Name>, Option<Vec<Certificate>>)> {
    match credentials {
        None => Ok((None, None)),
        Some(Credentials::Identity(der)) => {
            let name = Name::import_der(&der)
                .map_err(|_| Error::protocol("illegal identity data"))?;
            Ok((Some(name), None))
        },
        Some(Credentials::CertChain(ders)) => {
            let max_keylen = vts.borrow().config.max_keylen;
            let mut chain: Vec<Certificate> = Vec::with_capacity(ders.len());
            for der in &ders {
                let cert = Certificate::import_cert(der, X509Format::Der)
                    .map_err(|_| Error::protocol("illegal certificate data"))?;
                if let Some(max) = max_keylen
                    && cert.subject_key().exceeds_len(max)
                {
                    return Err(Error::protocol(
                        "certificate key exceeds max length",
                    ));
                }
                if let Some(prev) = chain.last()
                    && !prev.certified_by(&cert)
                {
                    return Err(Error::auth(
                        "certificate chain does not validate",
                    ));
                }
                chain.push(cert);
            }
            let Some(key) = key else {
                return Err(Error::protocol("credentials sent without a key"));
            };
            let leaf = chain.first().expect("non-empty chain");
            if leaf.subject_key() != &key.public()? {
                return Err(Error::auth(
                    "peer key does not match first certificate",
                ));
            }
            let identity = leaf.subject().clone();
            Ok((Some(identity), Some(chain)))
        },
    }
}

/// Applies the authorization policy and the control-channel hook.
pub(crate) fn run_authorization(vts: &Vts) -> Result<()> {
    let (authorizer, key, identity, certs, pp_consumer) = {
        let st = vts.borrow();
        (
            st.authorizer.clone(),
            st.peer_pub_key.clone(),
            st.peer_identity.clone(),
            st.peer_certificates.clone(),
            st.pp_consumer.clone(),
        )
    };

    if let Some(auth) = authorizer {
        if auth.require_key() && key.is_none() {
            return Err(Error::auth("authorization requires a peer key"));
        }
        if auth.require_cert() && certs.as_deref().is_none_or(|c| c.is_empty()) {
            return Err(Error::auth("authorization requires certificates"));
        }
        if auth.require_root()
            && let Some(chain) = certs.as_deref().filter(|c| !c.is_empty())
        {
            let last = chain.last().expect("non-empty chain");
            let last_der = last.export(X509Format::Der)?;
            let mut trusted = false;
            for ca in auth.root_certificates() {
                if last_der == ca.export(X509Format::Der)?
                    || last.certified_by(ca)
                {
                    trusted = true;
                    break;
                }
            }
            if !trusted {
                return Err(Error::auth("authorization requires a trusted root"));
            }
        }
        if !auth.accept_credentials(
            key.as_ref(),
            identity.as_ref(),
            certs.as_deref().unwrap_or(&[]),
        ) {
            return Err(Error::auth("peer credentials not authorized"));
        }
    }

    // Ask the attached plaintext consumer chain; a missing control
    // handler counts as approval.
    if let Some(consumer) = pp_consumer {
        let creds = PeerCredentials {
            key,
            identity,
            certificates: certs.unwrap_or_default(),
            protocol: "VTS",
        };
        if let ControlResult::Authorized(false) =
            consumer.borrow_mut().control(Control::Authorize(creds))
        {
            return Err(Error::auth("peer credentials not authorized"));
        }
    }
    Ok(())
}

/// Approval hook for the bare peer key, before credentials are parsed.
pub(crate) fn approve_peer_key(vts: &Vts, key: &RsaKey) -> Result<()> {
    let hook = vts.borrow().approve_key.clone();
    if let Some(hook) = hook
        && !hook(key)
    {
        return Err(Error::auth("peer public key was rejected"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Endpoint wrappers

struct PlainConsumer {
    vts: Vts,
}

impl ByteConsumer for PlainConsumer {
    fn consume(&mut self, data: &ByteBuf, clim: i64) -> Result<i64> {
        pc_consume(&self.vts, data, clim)
    }

    fn end_consume(&mut self, clean: bool) {
        pc_end_consume(&self.vts, clean);
    }

    fn abort(&mut self) {
        pc_abort(&self.vts);
    }

    fn set_producer(&mut self, producer: ProducerRef) -> Result<()> {
        let mut st = self.vts.borrow_mut();
        if st.pc_eod {
            return Err(Error::resource("consumer already received end-of-data"));
        }
        if st.pc_producer.is_some() {
            return Err(Error::resource("producer already connected"));
        }
        st.pc_producer = Some(producer);
        st.pc_consumed = 0;
        st.pc_consume_lim = 0;
        Ok(())
    }

    fn clear_producer(&mut self) {
        let mut st = self.vts.borrow_mut();
        st.pc_producer = None;
        st.pc_consumed = 0;
        st.pc_consume_lim = 0;
    }

    fn producer(&self) -> Option<ProducerRef> {
        self.vts.borrow().pc_producer.clone()
    }

    fn on_attached(&mut self) {
        let ready = {
            let st = self.vts.borrow();
            !st.handshaking && st.have_protocol
        };
        if ready {
            enable_plaintext(&self.vts);
        }
    }

    fn reverse(&self) -> Option<ProducerRef> {
        self.vts.borrow().pp_iface.as_ref().and_then(Weak::upgrade)
    }
}

struct PlainProducer {
    vts: Vts,
}

impl ByteProducer for PlainProducer {
    fn can_produce(&mut self, limit: i64) {
        pp_can_produce(&self.vts, limit);
    }

    fn abort(&mut self) {
        pp_abort(&self.vts);
    }

    fn set_consumer(&mut self, consumer: ConsumerRef) -> Result<()> {
        let mut st = self.vts.borrow_mut();
        if st.pp_consumer.is_some() {
            return Err(Error::resource("consumer already attached"));
        }
        if st.pp_eod() {
            return Err(Error::resource("producer already reached end-of-data"));
        }
        st.pp_consumer = Some(consumer);
        st.pp_produced = 0;
        st.pp_produce_lim = 0;
        Ok(())
    }

    fn clear_consumer(&mut self) {
        let mut st = self.vts.borrow_mut();
        st.pp_consumer = None;
        st.pp_produced = 0;
        st.pp_produce_lim = 0;
    }

    fn consumer(&self) -> Option<ConsumerRef> {
        self.vts.borrow().pp_consumer.clone()
    }

    fn on_attached(&mut self) {
        // A plaintext reader enables ciphertext intake.
        let target = {
            let mut st = self.vts.borrow_mut();
            if st.cc_producer.is_some() && !st.cc_eod {
                let max_add =
                    credit(st.cc_rbuf.len() as i64, &[st.config.rbuf_len]);
                st.cc_consume_lim = if max_add >= 0 {
                    st.cc_consumed + max_add
                } else {
                    UNBOUNDED
                };
                st.cc_producer.clone().map(|p| (p, st.cc_consume_lim))
            } else {
                None
            }
        };
        if let Some((producer, lim)) = target {
            producer.borrow_mut().can_produce(lim);
        }
    }

    fn control(&mut self, msg: Control) -> ControlResult {
        match msg {
            Control::RequestProducerState(consumer) => {
                // Pass through to the wire producer, then offer the
                // authenticated peer credentials for authorization.
                let (cc_producer, has_peer, reactor) = {
                    let st = self.vts.borrow();
                    (
                        st.cc_producer.clone(),
                        st.peer_pub_key.is_some(),
                        st.reactor.clone(),
                    )
                };
                if let Some(producer) = cc_producer {
                    let _ = producer
                        .borrow_mut()
                        .control(Control::RequestProducerState(consumer));
                }
                if has_peer {
                    let vts = self.vts.clone();
                    let _ = reactor.schedule(Duration::ZERO, move || {
                        if run_authorization(&vts).is_err() {
                            pc_abort(&vts);
                            pp_abort(&vts);
                        }
                    });
                }
                ControlResult::Handled
            },
            _ => ControlResult::Unhandled,
        }
    }

    fn reverse(&self) -> Option<ConsumerRef> {
        self.vts.borrow().pc_iface.as_ref().and_then(Weak::upgrade)
    }
}

struct CipherConsumer {
    vts: Vts,
}

impl ByteConsumer for CipherConsumer {
    fn consume(&mut self, data: &ByteBuf, clim: i64) -> Result<i64> {
        cc_consume(&self.vts, data, clim)
    }

    fn end_consume(&mut self, clean: bool) {
        cc_end_consume(&self.vts, clean);
    }

    fn abort(&mut self) {
        cc_abort(&self.vts);
    }

    fn set_producer(&mut self, producer: ProducerRef) -> Result<()> {
        let mut st = self.vts.borrow_mut();
        if st.cc_eod {
            return Err(Error::resource("consumer already received end-of-data"));
        }
        if st.cc_producer.is_some() {
            return Err(Error::resource("producer already connected"));
        }
        st.cc_producer = Some(producer);
        st.cc_consumed = 0;
        let max_add = credit(st.cc_rbuf.len() as i64, &[st.config.rbuf_len]);
        st.cc_consume_lim = if max_add >= 0 { max_add } else { UNBOUNDED };
        Ok(())
    }

    fn clear_producer(&mut self) {
        let mut st = self.vts.borrow_mut();
        st.cc_producer = None;
        st.cc_consumed = 0;
        st.cc_consume_lim = 0;
    }

    fn producer(&self) -> Option<ProducerRef> {
        self.vts.borrow().cc_producer.clone()
    }

    fn on_attached(&mut self) {
        let target = {
            let st = self.vts.borrow();
            st.cc_producer.clone().map(|p| (p, st.cc_consume_lim))
        };
        if let Some((producer, lim)) = target {
            producer.borrow_mut().can_produce(lim);
        }
    }

    fn reverse(&self) -> Option<ProducerRef> {
        self.vts.borrow().cp_iface.as_ref().and_then(Weak::upgrade)
    }
}

struct CipherProducer {
    vts: Vts,
}

impl ByteProducer for CipherProducer {
    fn can_produce(&mut self, limit: i64) {
        cp_can_produce(&self.vts, limit);
    }

    fn abort(&mut self) {
        cp_abort(&self.vts);
    }

    fn set_consumer(&mut self, consumer: ConsumerRef) -> Result<()> {
        let mut st = self.vts.borrow_mut();
        if st.cp_consumer.is_some() {
            return Err(Error::resource("consumer already attached"));
        }
        if st.cp_eod() {
            return Err(Error::resource("producer already reached end-of-data"));
        }
        st.cp_consumer = Some(consumer);
        st.cp_produced = 0;
        st.cp_produce_lim = 0;
        Ok(())
    }

    fn clear_consumer(&mut self) {
        let mut st = self.vts.borrow_mut();
        st.cp_consumer = None;
        st.cp_produced = 0;
        st.cp_produce_lim = 0;
    }

    fn consumer(&self) -> Option<ConsumerRef> {
        self.vts.borrow().cp_consumer.clone()
    }

    fn on_attached(&mut self) {
        let ready = {
            let st = self.vts.borrow();
            st.pc_producer.is_some() && !st.handshaking && st.have_protocol
        };
        if ready {
            enable_plaintext(&self.vts);
        }
    }

    fn reverse(&self) -> Option<ConsumerRef> {
        self.vts.borrow().cc_iface.as_ref().and_then(Weak::upgrade)
    }
}

// ---------------------------------------------------------------------------
// Public channel handle

/// One end of a VTS secure channel.
pub struct VtsChannel {
    shared: Vts,
    pub plain_consume: ConsumerRef,
    pub plain_produce: ProducerRef,
    pub cipher_consume: ConsumerRef,
    pub cipher_produce: ProducerRef,
}

impl VtsChannel {
    /// Client-side bridge. A keypair is optional: without one the
    /// channel runs the anonymous fast path and cannot send
    /// credentials.
    pub fn client(reactor: &LocalReactor, opts: ChannelOptions) -> Result<VtsChannel> {
        if opts.keypair.is_none()
            && (opts.identity.is_some() || opts.certificates.is_some())
        {
            return Err(Error::validation(
                "identity or certificates require a keypair",
            ));
        }
        VtsChannel::new(reactor, Role::Client, opts)
    }

    /// Server-side bridge; the server always presents a key.
    pub fn server(reactor: &LocalReactor, opts: ChannelOptions) -> Result<VtsChannel> {
        let keypair = opts
            .keypair
            .as_ref()
            .ok_or_else(|| Error::validation("server channel requires a keypair"))?;
        if !keypair.has_private() || !keypair.has_public() {
            return Err(Error::validation("server channel requires a full keypair"));
        }
        VtsChannel::new(reactor, Role::Server, opts)
    }

    fn new(reactor: &LocalReactor, role: Role, opts: ChannelOptions) -> Result<VtsChannel> {
        if opts.identity.is_some() && opts.certificates.is_some() {
            return Err(Error::validation(
                "only one of identity and certificates may be set",
            ));
        }
        let proto_send = Rc::new(ByteBuf::from_slice(PROTO_HELLO));
        let shared = Rc::new(RefCell::new(VtsShared {
            reactor: reactor.clone(),
            role,
            config: opts.config,
            keypair: opts.keypair,
            identity: opts.identity,
            certificates: opts.certificates,
            authorizer: opts.authorizer,
            approve_key: opts.approve_key,
            hmac_kind: None,
            cipher: None,
            hash_kind: None,
            rand_c: Vec::new(),
            rand_s: Vec::new(),
            srand_c: Vec::new(),
            srand_s: Vec::new(),
            peer_pub_key: None,
            peer_identity: None,
            peer_certificates: None,
            peer_max_keylen: None,
            peer_hshake_lim: None,
            msg_encrypter: None,
            msg_decrypter: None,
            have_protocol: false,
            proto_data: Vec::new(),
            proto_send: Some(proto_send),
            can_send_proto: role == Role::Client,
            handshaking: false,
            end_handshaking: false,
            hs_reader: None,
            hs_writer: None,
            hs_step: None,
            pc_producer: None,
            pc_consumed: 0,
            pc_consume_lim: 0,
            pc_eod: false,
            pc_eod_clean: false,
            pc_aborted: false,
            pc_rbuf: Rc::new(ByteBuf::new()),
            pp_consumer: None,
            pp_produced: 0,
            pp_produce_lim: 0,
            pp_sent_eod: false,
            pp_wbuf: Rc::new(ByteBuf::new()),
            cc_producer: None,
            cc_consumed: 0,
            cc_consume_lim: 0,
            cc_eod: false,
            cc_eod_clean: false,
            cc_aborted: false,
            cc_rbuf: Rc::new(ByteBuf::new()),
            cp_consumer: None,
            cp_produced: 0,
            cp_produce_lim: 0,
            cp_sent_eod: false,
            cp_wbuf: Rc::new(ByteBuf::new()),
            pc_iface: None,
            pp_iface: None,
            cc_iface: None,
            cp_iface: None,
        }));

        let pc = Rc::new(RefCell::new(PlainConsumer {
            vts: shared.clone(),
        }));
        let pp = Rc::new(RefCell::new(PlainProducer {
            vts: shared.clone(),
        }));
        let cc = Rc::new(RefCell::new(CipherConsumer {
            vts: shared.clone(),
        }));
        let cp = Rc::new(RefCell::new(CipherProducer {
            vts: shared.clone(),
        }));
        {
            let mut st = shared.borrow_mut();
            st.pc_iface =
                Some(Rc::downgrade(&pc) as Weak<RefCell<dyn ByteConsumer>>);
            st.pp_iface =
                Some(Rc::downgrade(&pp) as Weak<RefCell<dyn ByteProducer>>);
            st.cc_iface =
                Some(Rc::downgrade(&cc) as Weak<RefCell<dyn ByteConsumer>>);
            st.cp_iface =
                Some(Rc::downgrade(&cp) as Weak<RefCell<dyn ByteProducer>>);
        }

        Ok(VtsChannel {
            shared,
            plain_consume: pc,
            plain_produce: pp,
            cipher_consume: cc,
            cipher_produce: cp,
        })
    }

    /// Aborts the channel if the handshake has not completed within
    /// `timeout`. Cancel the returned handle to disarm.
    pub fn set_handshake_timeout(&self, timeout: Duration) -> CallHandle {
        let weak = Rc::downgrade(&self.shared);
        let reactor = self.shared.borrow().reactor.clone();
        reactor.schedule(timeout, move || {
            let Some(vts) = weak.upgrade() else {
                return;
            };
            let pending = {
                let st = vts.borrow();
                st.handshaking || !st.have_protocol
            };
            if pending {
                warn!("channel handshake timed out");
                error_dismantle(&vts);
            }
        })
    }

    /// True once the handshake has completed and traffic may flow.
    pub fn is_running(&self) -> bool {
        let st = self.shared.borrow();
        st.have_protocol && !st.handshaking
    }

    pub fn is_aborted(&self) -> bool {
        let st = self.shared.borrow();
        st.pc_aborted || st.cc_aborted
    }

    /// Authenticated peer credentials, once available.
    pub fn peer_credentials(&self) -> Option<PeerCredentials> {
        let st = self.shared.borrow();
        st.peer_pub_key.as_ref().map(|key| PeerCredentials {
            key: Some(key.clone()),
            identity: st.peer_identity.clone(),
            certificates: st.peer_certificates.clone().unwrap_or_default(),
            protocol: "VTS",
        })
    }

    pub(crate) fn shared(&self) -> &Vts {
        &self.shared
    }
}
