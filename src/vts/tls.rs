// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! TLS channel bridge.
//!
//! Presents the same four-endpoint contract as the VTS bridge while
//! delegating the record layer to a platform TLS implementation
//! (rustls, driven sans-IO): ciphertext feeds `read_tls`, plaintext
//! feeds the connection writer, and pending records drain through
//! `write_tls` into the ciphertext producer.

use std::{
    cell::RefCell,
    io::{Read, Write},
    rc::{Rc, Weak},
    sync::Arc,
    time::Duration,
};

use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    io::{
        ByteConsumer, ByteProducer, ConsumerRef, ProducerRef, UNBOUNDED,
        buf::ByteBuf, credit,
    },
    reactor::LocalReactor,
};

struct TlsShared {
    reactor: LocalReactor,
    conn: Connection,

    rbuf_len: i64,
    max_write: i64,

    pc_producer: Option<ProducerRef>,
    pc_consumed: i64,
    pc_consume_lim: i64,
    pc_eod: bool,
    pc_eod_clean: bool,

    pp_consumer: Option<ConsumerRef>,
    pp_produced: i64,
    pp_produce_lim: i64,
    pp_wbuf: Rc<ByteBuf>,
    pp_sent_eod: bool,
    plain_eof: bool,

    cc_producer: Option<ProducerRef>,
    cc_consumed: i64,
    cc_consume_lim: i64,
    cc_eod: bool,

    cp_consumer: Option<ConsumerRef>,
    cp_produced: i64,
    cp_produce_lim: i64,
    cp_wbuf: Rc<ByteBuf>,
    cp_sent_eod: bool,

    aborted: bool,

    pc_iface: Option<Weak<RefCell<dyn ByteConsumer>>>,
    pp_iface: Option<Weak<RefCell<dyn ByteProducer>>>,
    cc_iface: Option<Weak<RefCell<dyn ByteConsumer>>>,
    cp_iface: Option<Weak<RefCell<dyn ByteProducer>>>,
}

type Tls = Rc<RefCell<TlsShared>>;

/// Writes TLS records into a shared byte buffer.
struct BufSink<'a>(&'a ByteBuf);

impl Write for BufSink<'_> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0.append_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn sched(reactor: &LocalReactor, tls: &Tls, f: fn(&Tls)) {
    let tls = tls.clone();
    let _ = reactor.schedule(Duration::ZERO, move || f(&tls));
}

/// Moves pending records out of the connection and decrypted plaintext
/// into the plaintext write buffer.
fn pump(tls: &Tls) -> Result<()> {
    let mut st = tls.borrow_mut();
    let cp_wbuf = st.cp_wbuf.clone();
    while st.conn.wants_write() {
        let mut sink = BufSink(&cp_wbuf);
        st.conn.write_tls(&mut sink).map_err(Error::Io)?;
    }

    let pp_wbuf = st.pp_wbuf.clone();
    let mut scratch = [0u8; 0x4000];
    loop {
        match st.conn.reader().read(&mut scratch) {
            Ok(0) => {
                // Peer sent close_notify.
                st.plain_eof = true;
                break;
            },
            Ok(n) => pp_wbuf.append_slice(&scratch[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                st.plain_eof = true;
                break;
            },
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(())
}

fn abort_all(tls: &Tls) {
    let taken = {
        let mut st = tls.borrow_mut();
        if st.aborted {
            None
        } else {
            st.aborted = true;
            st.pc_eod = true;
            st.cc_eod = true;
            st.pp_wbuf.clear();
            st.cp_wbuf.clear();
            Some((
                st.pc_producer.take(),
                st.pp_consumer.take(),
                st.cc_producer.take(),
                st.cp_consumer.take(),
            ))
        }
    };
    let Some((pc_p, pp_c, cc_p, cp_c)) = taken else {
        return;
    };
    for producer in [pc_p, cc_p].into_iter().flatten() {
        producer.borrow_mut().abort();
        producer.borrow_mut().clear_consumer();
    }
    for consumer in [pp_c, cp_c].into_iter().flatten() {
        consumer.borrow_mut().abort();
        consumer.borrow_mut().clear_producer();
    }
}

fn cp_do_produce(tls: &Tls) {
    let (consumer, wbuf, max_write) = {
        let mut st = tls.borrow_mut();
        let Some(consumer) = st.cp_consumer.clone() else {
            return;
        };
        let send_eod = st.pc_eod
            && !st.conn.wants_write()
            && st.cp_wbuf.is_empty()
            && !st.cp_sent_eod;
        if send_eod {
            st.cp_sent_eod = true;
            let clean = st.pc_eod_clean;
            drop(st);
            consumer.borrow_mut().end_consume(clean);
            return;
        }
        if st.cp_wbuf.is_empty() {
            return;
        }
        if st.cp_produce_lim >= 0 && st.cp_produce_lim <= st.cp_produced {
            return;
        }
        let mut max_write = credit(st.cp_produced, &[st.cp_produce_lim]);
        max_write = if max_write < 0 {
            st.max_write
        } else if st.max_write >= 0 {
            max_write.min(st.max_write)
        } else {
            max_write
        };
        (consumer, st.cp_wbuf.clone(), max_write)
    };
    if max_write == 0 {
        return;
    }
    let before = wbuf.len();
    let result = consumer.borrow_mut().consume(&wbuf, max_write);
    let (reactor, again) = {
        let mut st = tls.borrow_mut();
        match result {
            Ok(new_lim) => {
                st.cp_produce_lim = new_lim;
                st.cp_produced += (before - wbuf.len()) as i64;
            },
            Err(e) => {
                warn!("tls ciphertext consumer failed: {e}");
                drop(st);
                abort_all(tls);
                return;
            },
        }
        (st.reactor.clone(), !st.cp_wbuf.is_empty())
    };
    if again {
        sched(&reactor, tls, cp_do_produce);
    }
}

fn pp_do_produce(tls: &Tls) {
    let (consumer, wbuf, max_write) = {
        let mut st = tls.borrow_mut();
        let Some(consumer) = st.pp_consumer.clone() else {
            return;
        };
        let eod = (st.cc_eod || st.plain_eof)
            && st.pp_wbuf.is_empty()
            && !st.pp_sent_eod;
        if eod {
            st.pp_sent_eod = true;
            let clean = st.plain_eof;
            drop(st);
            consumer.borrow_mut().end_consume(clean);
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
            st.max_write
        } else if st.max_write >= 0 {
            max_write.min(st.max_write)
        } else {
            max_write
        };
        (consumer, st.pp_wbuf.clone(), max_write)
    };
    if max_write == 0 {
        return;
    }
    let before = wbuf.len();
    let result = consumer.borrow_mut().consume(&wbuf, max_write);
    {
        let mut st = tls.borrow_mut();
        match result {
            Ok(new_lim) => {
                st.pp_produce_lim = new_lim;
                st.pp_produced += (before - wbuf.len()) as i64;
            },
            Err(e) => {
                warn!("tls plaintext consumer failed: {e}");
                drop(st);
                abort_all(tls);
            },
        }
    }
}

/// TLS bridge endpoints.
pub struct TlsBridge {
    shared: Tls,
    pub plain_consume: ConsumerRef,
    pub plain_produce: ProducerRef,
    pub cipher_consume: ConsumerRef,
    pub cipher_produce: ProducerRef,
}

impl TlsBridge {
    pub fn client(
        reactor: &LocalReactor,
        config: Arc<ClientConfig>,
        server_name: rustls::pki_types::ServerName<'static>,
    ) -> Result<TlsBridge> {
        let conn = ClientConnection::new(config, server_name)
            .map_err(|e| Error::crypto(format!("tls client setup failed: {e}")))?;
        Ok(TlsBridge::new(reactor, Connection::Client(conn)))
    }

    pub fn server(
        reactor: &LocalReactor,
        config: Arc<ServerConfig>,
    ) -> Result<TlsBridge> {
        let conn = ServerConnection::new(config)
            .map_err(|e| Error::crypto(format!("tls server setup failed: {e}")))?;
        Ok(TlsBridge::new(reactor, Connection::Server(conn)))
    }

    fn new(reactor: &LocalReactor, conn: Connection) -> TlsBridge {
        let shared = Rc::new(RefCell::new(TlsShared {
            reactor: reactor.clone(),
            conn,
            rbuf_len: 0x4000,
            max_write: 0x4000,
            pc_producer: None,
            pc_consumed: 0,
            pc_consume_lim: 0,
            pc_eod: false,
            pc_eod_clean: false,
            pp_consumer: None,
            pp_produced: 0,
            pp_produce_lim: 0,
            pp_wbuf: Rc::new(ByteBuf::new()),
            pp_sent_eod: false,
            plain_eof: false,
            cc_producer: None,
            cc_consumed: 0,
            cc_consume_lim: 0,
            cc_eod: false,
            cp_consumer: None,
            cp_produced: 0,
            cp_produce_lim: 0,
            cp_wbuf: Rc::new(ByteBuf::new()),
            cp_sent_eod: false,
            aborted: false,
            pc_iface: None,
            pp_iface: None,
            cc_iface: None,
            cp_iface: None,
        }));
        let pc = Rc::new(RefCell::new(TlsPlainConsumer {
            tls: shared.clone(),
        }));
        let pp = Rc::new(RefCell::new(TlsPlainProducer {
            tls: shared.clone(),
        }));
        let cc = Rc::new(RefCell::new(TlsCipherConsumer {
            tls: shared.clone(),
        }));
        let cp = Rc::new(RefCell::new(TlsCipherProducer {
            tls: shared.clone(),
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
        TlsBridge {
            shared,
            plain_consume: pc,
            plain_produce: pp,
            cipher_consume: cc,
            cipher_produce: cp,
        }
    }

    pub fn is_handshaking(&self) -> bool {
        self.shared.borrow().conn.is_handshaking()
    }
}

struct TlsPlainConsumer {
    tls: Tls,
}

impl ByteConsumer for TlsPlainConsumer {
    fn consume(&mut self, data: &ByteBuf, clim: i64) -> Result<i64> {
        let reactor = {
            let mut st = self.tls.borrow_mut();
            if st.pc_eod {
                return Err(Error::resource("consumer already received end-of-data"));
            }
            if st.pc_producer.is_none() {
                return Err(Error::resource("no connected producer"));
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
            let chunk = data.pop(take);
            st.pc_consumed += chunk.len() as i64;
            st.conn
                .writer()
                .write_all(&chunk)
                .map_err(Error::Io)?;
            st.reactor.clone()
        };
        if let Err(e) = pump(&self.tls) {
            debug!("tls pump failed: {e}");
            abort_all(&self.tls);
            return Err(e);
        }
        sched(&reactor, &self.tls, cp_do_produce);
        let mut st = self.tls.borrow_mut();
        st.pc_consume_lim = st.pc_consumed + st.rbuf_len.max(0);
        Ok(st.pc_consume_lim)
    }

    fn end_consume(&mut self, clean: bool) {
        let reactor = {
            let mut st = self.tls.borrow_mut();
            if st.pc_eod {
                return;
            }
            st.pc_eod = true;
            st.pc_eod_clean = clean;
            st.conn.send_close_notify();
            st.reactor.clone()
        };
        if pump(&self.tls).is_err() {
            abort_all(&self.tls);
            return;
        }
        sched(&reactor, &self.tls, cp_do_produce);
    }

    fn abort(&mut self) {
        abort_all(&self.tls);
    }

    fn set_producer(&mut self, producer: ProducerRef) -> Result<()> {
        let mut st = self.tls.borrow_mut();
        if st.pc_producer.is_some() {
            return Err(Error::resource("producer already connected"));
        }
        st.pc_producer = Some(producer);
        st.pc_consumed = 0;
        st.pc_consume_lim = 0;
        Ok(())
    }

    fn clear_producer(&mut self) {
        let mut st = self.tls.borrow_mut();
        st.pc_producer = None;
        st.pc_consumed = 0;
        st.pc_consume_lim = 0;
    }

    fn producer(&self) -> Option<ProducerRef> {
        self.tls.borrow().pc_producer.clone()
    }

    fn on_attached(&mut self) {
        let target = {
            let mut st = self.tls.borrow_mut();
            st.pc_consume_lim = st.pc_consumed + st.rbuf_len.max(0);
            st.pc_producer.clone().map(|p| (p, st.pc_consume_lim))
        };
        if let Some((producer, lim)) = target {
            producer.borrow_mut().can_produce(lim);
        }
    }

    fn reverse(&self) -> Option<ProducerRef> {
        self.tls.borrow().pp_iface.as_ref().and_then(Weak::upgrade)
    }
}

struct TlsPlainProducer {
    tls: Tls,
}

impl ByteProducer for TlsPlainProducer {
    fn can_produce(&mut self, limit: i64) {
        let (reactor, raised) = {
            let mut st = self.tls.borrow_mut();
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
            (st.reactor.clone(), raised)
        };
        if raised {
            sched(&reactor, &self.tls, pp_do_produce);
        }
    }

    fn abort(&mut self) {
        abort_all(&self.tls);
    }

    fn set_consumer(&mut self, consumer: ConsumerRef) -> Result<()> {
        let mut st = self.tls.borrow_mut();
        if st.pp_consumer.is_some() {
            return Err(Error::resource("consumer already attached"));
        }
        st.pp_consumer = Some(consumer);
        st.pp_produced = 0;
        st.pp_produce_lim = 0;
        Ok(())
    }

    fn clear_consumer(&mut self) {
        let mut st = self.tls.borrow_mut();
        st.pp_consumer = None;
        st.pp_produced = 0;
        st.pp_produce_lim = 0;
    }

    fn consumer(&self) -> Option<ConsumerRef> {
        self.tls.borrow().pp_consumer.clone()
    }

    fn reverse(&self) -> Option<ConsumerRef> {
        self.tls.borrow().pc_iface.as_ref().and_then(Weak::upgrade)
    }
}

struct TlsCipherConsumer {
    tls: Tls,
}

impl ByteConsumer for TlsCipherConsumer {
    fn consume(&mut self, data: &ByteBuf, clim: i64) -> Result<i64> {
        let reactor = {
            let mut st = self.tls.borrow_mut();
            if st.cc_eod {
                return Err(Error::resource("consumer already received end-of-data"));
            }
            if st.cc_producer.is_none() {
                return Err(Error::resource("no connected producer"));
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
            let chunk = data.pop(take);
            st.cc_consumed += chunk.len() as i64;

            let mut reader: &[u8] = &chunk;
            while !reader.is_empty() {
                match st.conn.read_tls(&mut reader) {
                    Ok(0) => break,
                    Ok(_) => {},
                    Err(e) => return Err(Error::Io(e)),
                }
            }
            if let Err(e) = st.conn.process_new_packets() {
                return Err(Error::crypto(format!("tls processing failed: {e}")));
            }
            st.reactor.clone()
        };

        if let Err(e) = pump(&self.tls) {
            debug!("tls pump failed: {e}");
            abort_all(&self.tls);
            return Err(e);
        }
        sched(&reactor, &self.tls, cp_do_produce);
        pp_do_produce(&self.tls);

        let mut st = self.tls.borrow_mut();
        st.cc_consume_lim = st.cc_consumed + st.rbuf_len.max(0);
        Ok(st.cc_consume_lim)
    }

    fn end_consume(&mut self, clean: bool) {
        {
            let mut st = self.tls.borrow_mut();
            if st.cc_eod {
                return;
            }
            st.cc_eod = true;
            let _ = clean;
        }
        pp_do_produce(&self.tls);
    }

    fn abort(&mut self) {
        abort_all(&self.tls);
    }

    fn set_producer(&mut self, producer: ProducerRef) -> Result<()> {
        let mut st = self.tls.borrow_mut();
        if st.cc_producer.is_some() {
            return Err(Error::resource("producer already connected"));
        }
        st.cc_producer = Some(producer);
        st.cc_consumed = 0;
        st.cc_consume_lim = st.rbuf_len.max(0);
        Ok(())
    }

    fn clear_producer(&mut self) {
        let mut st = self.tls.borrow_mut();
        st.cc_producer = None;
        st.cc_consumed = 0;
        st.cc_consume_lim = 0;
    }

    fn producer(&self) -> Option<ProducerRef> {
        self.tls.borrow().cc_producer.clone()
    }

    fn on_attached(&mut self) {
        let target = {
            let st = self.tls.borrow();
            st.cc_producer.clone().map(|p| (p, st.cc_consume_lim))
        };
        if let Some((producer, lim)) = target {
            producer.borrow_mut().can_produce(lim);
        }
    }

    fn reverse(&self) -> Option<ProducerRef> {
        self.tls.borrow().cp_iface.as_ref().and_then(Weak::upgrade)
    }
}

struct TlsCipherProducer {
    tls: Tls,
}

impl ByteProducer for TlsCipherProducer {
    fn can_produce(&mut self, limit: i64) {
        let (reactor, raised) = {
            let mut st = self.tls.borrow_mut();
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
            (st.reactor.clone(), raised)
        };
        if raised {
            sched(&reactor, &self.tls, cp_do_produce);
        }
    }

    fn abort(&mut self) {
        abort_all(&self.tls);
    }

    fn set_consumer(&mut self, consumer: ConsumerRef) -> Result<()> {
        let mut st = self.tls.borrow_mut();
        if st.cp_consumer.is_some() {
            return Err(Error::resource("consumer already attached"));
        }
        st.cp_consumer = Some(consumer);
        st.cp_produced = 0;
        st.cp_produce_lim = 0;
        Ok(())
    }

    fn clear_consumer(&mut self) {
        let mut st = self.tls.borrow_mut();
        st.cp_consumer = None;
        st.cp_produced = 0;
        st.cp_produce_lim = 0;
    }

    fn consumer(&self) -> Option<ConsumerRef> {
        self.tls.borrow().cp_consumer.clone()
    }

    fn on_attached(&mut self) {
        // A client connection has records to send immediately.
        let reactor = {
            let st = self.tls.borrow();
            st.reactor.clone()
        };
        if pump(&self.tls).is_err() {
            abort_all(&self.tls);
            return;
        }
        sched(&reactor, &self.tls, cp_do_produce);
    }

    fn reverse(&self) -> Option<ConsumerRef> {
        self.tls.borrow().cc_iface.as_ref().and_then(Weak::upgrade)
    }
}
