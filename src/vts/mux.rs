// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Early-byte transport multiplexer.
//!
//! On an inbound connection the first byte selects the transport: a
//! `V` opens the VTS hello, a TLS record type byte selects TLS, and
//! anything else falls through to insecure plaintext when enabled.
//! The selected transport presents the same cipher-side endpoint
//! contract as the VTS bridge; bytes peeked during classification are
//! replayed into it.

use std::{
    cell::RefCell,
    rc::{Rc, Weak},
    time::Duration,
};

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    io::{
        ByteConsumer, ByteProducer, ConsumerRef, ProducerRef, UNBOUNDED,
        buf::ByteBuf, credit, link,
    },
    reactor::LocalReactor,
};

bitflags! {
    /// Transports an endpoint is willing to accept.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransportMask: u8 {
        const VTS   = 1 << 0;
        const TLS   = 1 << 1;
        /// Insecure plaintext; off unless explicitly enabled.
        const PLAIN = 1 << 2;
    }
}

impl Default for TransportMask {
    fn default() -> Self {
        TransportMask::VTS | TransportMask::TLS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectedTransport {
    Vts,
    Tls,
    Plain,
}

/// Cipher-facing endpoints of a selected transport bridge.
pub struct CipherEndpoints {
    pub consumer: ConsumerRef,
    pub producer: ProducerRef,
}

/// Builds the transport bridge once the first byte has classified the
/// connection.
pub type TransportSelector =
    Box<dyn FnMut(SelectedTransport) -> Result<CipherEndpoints>>;

fn classify(first: u8) -> SelectedTransport {
    match first {
        b'V' => SelectedTransport::Vts,
        // TLS handshake record, or an SSLv2-style hello.
        0x16 | 0x80 => SelectedTransport::Tls,
        _ => SelectedTransport::Plain,
    }
}

struct MuxShared {
    reactor: LocalReactor,
    enabled: TransportMask,
    selector: Option<TransportSelector>,
    selected: Option<SelectedTransport>,

    /// Wire bytes held until the transport is selected or while the
    /// inner consumer has no credit.
    pending: Rc<ByteBuf>,
    inner_consumer: Option<ConsumerRef>,
    inner_delivered: i64,
    inner_lim: i64,
    in_eod: Option<bool>,

    // External wire-facing flow state.
    ext_producer: Option<ProducerRef>,
    ext_consumed: i64,
    ext_consume_lim: i64,

    out_buf: Rc<ByteBuf>,
    ext_consumer: Option<ConsumerRef>,
    ext_produced: i64,
    ext_produce_lim: i64,
    ext_sent_eod: Option<bool>,

    aborted: bool,

    wire_producer_iface: Option<Weak<RefCell<dyn ByteProducer>>>,
    wire_consumer_iface: Option<Weak<RefCell<dyn ByteConsumer>>>,
    ext_consumer_iface: Option<Weak<RefCell<dyn ByteConsumer>>>,
    ext_producer_iface: Option<Weak<RefCell<dyn ByteProducer>>>,
}

type Mux = Rc<RefCell<MuxShared>>;

/// Pre-selection intake allowance.
const PEEK_WINDOW: i64 = 64;

fn sched(reactor: &LocalReactor, mux: &Mux, f: fn(&Mux)) {
    let mux = mux.clone();
    let _ = reactor.schedule(Duration::ZERO, move || f(&mux));
}

fn abort_all(mux: &Mux) {
    let taken = {
        let mut st = mux.borrow_mut();
        if st.aborted {
            None
        } else {
            st.aborted = true;
            st.pending.clear();
            st.out_buf.clear();
            Some((
                st.ext_producer.take(),
                st.ext_consumer.take(),
                st.inner_consumer.take(),
            ))
        }
    };
    let Some((producer, consumer, inner)) = taken else {
        return;
    };
    if let Some(producer) = producer {
        producer.borrow_mut().abort();
        producer.borrow_mut().clear_consumer();
    }
    if let Some(consumer) = consumer {
        consumer.borrow_mut().abort();
        consumer.borrow_mut().clear_producer();
    }
    if let Some(inner) = inner {
        inner.borrow_mut().abort();
    }
}

/// Pushes pending wire bytes into the selected transport under its
/// credit.
fn deliver_inner(mux: &Mux) {
    loop {
        let (consumer, pending, room) = {
            let st = mux.borrow();
            let Some(consumer) = st.inner_consumer.clone() else {
                return;
            };
            if st.pending.is_empty() {
                break;
            }
            let room = credit(st.inner_delivered, &[st.inner_lim]);
            if room == 0 {
                return;
            }
            (consumer, st.pending.clone(), room)
        };
        let before = pending.len();
        let result = consumer.borrow_mut().consume(&pending, room);
        let mut st = mux.borrow_mut();
        let moved = (before - pending.len()) as i64;
        st.inner_delivered += moved;
        match result {
            Ok(new_lim) => st.inner_lim = new_lim,
            Err(e) => {
                warn!("selected transport rejected input: {e}");
                drop(st);
                abort_all(mux);
                return;
            },
        }
        if moved == 0 {
            break;
        }
    }

    // Propagate a deferred end-of-data once the backlog is flushed.
    let target = {
        let st = mux.borrow();
        if st.pending.is_empty()
            && let (Some(clean), Some(consumer)) =
                (st.in_eod, st.inner_consumer.clone())
        {
            Some((consumer, clean))
        } else {
            None
        }
    };
    if let Some((consumer, clean)) = target {
        consumer.borrow_mut().end_consume(clean);
    }
}

/// Flushes transport output toward the wire consumer.
fn flush_out(mux: &Mux) {
    let (consumer, out_buf, max_write) = {
        let mut st = mux.borrow_mut();
        let Some(consumer) = st.ext_consumer.clone() else {
            return;
        };
        if st.out_buf.is_empty() {
            if let Some(clean) = st.ext_sent_eod.take() {
                drop(st);
                consumer.borrow_mut().end_consume(clean);
            }
            return;
        }
        let max_write = credit(st.ext_produced, &[st.ext_produce_lim]);
        if max_write == 0 {
            return;
        }
        (consumer, st.out_buf.clone(), max_write)
    };
    let before = out_buf.len();
    let result = consumer.borrow_mut().consume(&out_buf, max_write);
    let (reactor, again) = {
        let mut st = mux.borrow_mut();
        match result {
            Ok(new_lim) => {
                st.ext_produce_lim = new_lim;
                st.ext_produced += (before - out_buf.len()) as i64;
            },
            Err(e) => {
                warn!("wire consumer failed: {e}");
                drop(st);
                abort_all(mux);
                return;
            },
        }
        (st.reactor.clone(), !st.out_buf.is_empty())
    };
    if again {
        sched(&reactor, mux, flush_out);
    }
}

/// Recomputes and pushes the external consume limit to the wire
/// producer.
fn notify_ext(mux: &Mux) {
    let target = {
        let mut st = mux.borrow_mut();
        let old = st.ext_consume_lim;
        update_ext_lim(&mut st);
        if st.ext_consume_lim != old {
            st.ext_producer.clone().map(|p| (p, st.ext_consume_lim))
        } else {
            None
        }
    };
    if let Some((producer, lim)) = target {
        producer.borrow_mut().can_produce(lim);
    }
}

fn update_ext_lim(st: &mut MuxShared) {
    let window = if st.selected.is_none() {
        PEEK_WINDOW
    } else if st.inner_lim < 0 {
        UNBOUNDED
    } else {
        (st.inner_lim - st.inner_delivered).max(0) + PEEK_WINDOW
    };
    st.ext_consume_lim = if window < 0 {
        UNBOUNDED
    } else {
        st.ext_consumed + (window - st.pending.len() as i64).max(0)
    };
}

/// Wire-facing consumer: classifies, then forwards.
struct MuxCipherConsumer {
    mux: Mux,
}

impl ByteConsumer for MuxCipherConsumer {
    fn consume(&mut self, data: &ByteBuf, clim: i64) -> Result<i64> {
        let select = {
            let mut st = self.mux.borrow_mut();
            if st.aborted {
                return Err(Error::resource("multiplexer aborted"));
            }
            if st.ext_producer.is_none() {
                return Err(Error::resource("no connected producer"));
            }
            let mut max_cons = credit(st.ext_consumed, &[st.ext_consume_lim]);
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
            st.pending.append_list(chunks);
            st.ext_consumed += moved as i64;

            if st.selected.is_none() {
                let first = st.pending.peek(1);
                first.first().map(|b| (classify(*b), st.enabled))
            } else {
                None
            }
        };

        if let Some((transport, enabled)) = select {
            let allowed = match transport {
                SelectedTransport::Vts => enabled.contains(TransportMask::VTS),
                SelectedTransport::Tls => enabled.contains(TransportMask::TLS),
                SelectedTransport::Plain => {
                    enabled.contains(TransportMask::PLAIN)
                },
            };
            if !allowed {
                abort_all(&self.mux);
                return Err(Error::protocol(format!(
                    "transport {transport:?} not enabled"
                )));
            }
            let mut selector = self
                .mux
                .borrow_mut()
                .selector
                .take()
                .ok_or_else(|| Error::resource("transport already selected"))?;
            let endpoints = match selector(transport) {
                Ok(endpoints) => endpoints,
                Err(e) => {
                    abort_all(&self.mux);
                    return Err(e);
                },
            };
            debug!(?transport, "transport selected");
            {
                let mut st = self.mux.borrow_mut();
                st.selected = Some(transport);
                st.inner_consumer = Some(endpoints.consumer.clone());
            }
            // Wire the transport's cipher side to our inner endpoints.
            let (wire_producer, wire_consumer) = {
                let st = self.mux.borrow();
                (
                    st.wire_producer_iface.as_ref().and_then(Weak::upgrade),
                    st.wire_consumer_iface.as_ref().and_then(Weak::upgrade),
                )
            };
            if let Some(wire_producer) = wire_producer {
                link(&endpoints.consumer, &wire_producer)?;
            }
            if let Some(wire_consumer) = wire_consumer {
                link(&wire_consumer, &endpoints.producer)?;
            }
        }

        deliver_inner(&self.mux);

        let mut st = self.mux.borrow_mut();
        update_ext_lim(&mut st);
        Ok(st.ext_consume_lim)
    }

    fn end_consume(&mut self, clean: bool) {
        let deliver = {
            let mut st = self.mux.borrow_mut();
            if st.in_eod.is_some() {
                return;
            }
            st.in_eod = Some(clean);
            st.inner_consumer.is_some()
        };
        if deliver {
            deliver_inner(&self.mux);
        }
    }

    fn abort(&mut self) {
        abort_all(&self.mux);
    }

    fn set_producer(&mut self, producer: ProducerRef) -> Result<()> {
        let mut st = self.mux.borrow_mut();
        if st.ext_producer.is_some() {
            return Err(Error::resource("producer already connected"));
        }
        st.ext_producer = Some(producer);
        st.ext_consumed = 0;
        update_ext_lim(&mut st);
        Ok(())
    }

    fn clear_producer(&mut self) {
        let mut st = self.mux.borrow_mut();
        st.ext_producer = None;
        st.ext_consumed = 0;
        st.ext_consume_lim = 0;
    }

    fn producer(&self) -> Option<ProducerRef> {
        self.mux.borrow().ext_producer.clone()
    }

    fn on_attached(&mut self) {
        let target = {
            let st = self.mux.borrow();
            st.ext_producer.clone().map(|p| (p, st.ext_consume_lim))
        };
        if let Some((producer, lim)) = target {
            producer.borrow_mut().can_produce(lim);
        }
    }

    fn reverse(&self) -> Option<ProducerRef> {
        self.mux
            .borrow()
            .ext_producer_iface
            .as_ref()
            .and_then(Weak::upgrade)
    }
}

/// Wire-facing producer: transports' output toward the network.
struct MuxCipherProducer {
    mux: Mux,
}

impl ByteProducer for MuxCipherProducer {
    fn can_produce(&mut self, limit: i64) {
        let (reactor, raised) = {
            let mut st = self.mux.borrow_mut();
            let raised = if limit < 0 {
                if st.ext_produce_lim >= 0 {
                    st.ext_produce_lim = UNBOUNDED;
                    true
                } else {
                    false
                }
            } else if st.ext_produce_lim >= 0 && st.ext_produce_lim < limit {
                st.ext_produce_lim = limit;
                true
            } else {
                false
            };
            (st.reactor.clone(), raised)
        };
        if raised {
            sched(&reactor, &self.mux, flush_out);
        }
    }

    fn abort(&mut self) {
        abort_all(&self.mux);
    }

    fn set_consumer(&mut self, consumer: ConsumerRef) -> Result<()> {
        let mut st = self.mux.borrow_mut();
        if st.ext_consumer.is_some() {
            return Err(Error::resource("consumer already attached"));
        }
        st.ext_consumer = Some(consumer);
        st.ext_produced = 0;
        st.ext_produce_lim = 0;
        Ok(())
    }

    fn clear_consumer(&mut self) {
        let mut st = self.mux.borrow_mut();
        st.ext_consumer = None;
        st.ext_produced = 0;
        st.ext_produce_lim = 0;
    }

    fn consumer(&self) -> Option<ConsumerRef> {
        self.mux.borrow().ext_consumer.clone()
    }

    fn reverse(&self) -> Option<ConsumerRef> {
        self.mux
            .borrow()
            .ext_consumer_iface
            .as_ref()
            .and_then(Weak::upgrade)
    }
}

/// Internal producer feeding the selected transport's cipher consumer.
struct MuxWireProducer {
    mux: Mux,
}

impl ByteProducer for MuxWireProducer {
    fn can_produce(&mut self, limit: i64) {
        let (reactor, raised) = {
            let mut st = self.mux.borrow_mut();
            let raised = if limit < 0 {
                if st.inner_lim >= 0 {
                    st.inner_lim = UNBOUNDED;
                    true
                } else {
                    false
                }
            } else if st.inner_lim >= 0 && st.inner_lim < limit {
                st.inner_lim = limit;
                true
            } else {
                false
            };
            (st.reactor.clone(), raised)
        };
        if raised {
            // Delivery and the external credit update both run off the
            // loop; this path may be reached from inside the external
            // producer.
            sched(&reactor, &self.mux, deliver_inner);
            sched(&reactor, &self.mux, notify_ext);
        }
    }

    fn abort(&mut self) {
        abort_all(&self.mux);
    }

    fn set_consumer(&mut self, _consumer: ConsumerRef) -> Result<()> {
        // The inner consumer handle is recorded at selection time.
        Ok(())
    }

    fn clear_consumer(&mut self) {
        self.mux.borrow_mut().inner_consumer = None;
    }

    fn consumer(&self) -> Option<ConsumerRef> {
        self.mux.borrow().inner_consumer.clone()
    }
}

/// Internal consumer collecting the selected transport's cipher output.
struct MuxWireConsumer {
    mux: Mux,
    producer: Option<ProducerRef>,
}

impl ByteConsumer for MuxWireConsumer {
    fn consume(&mut self, data: &ByteBuf, clim: i64) -> Result<i64> {
        let (reactor, lim) = {
            let st = self.mux.borrow();
            if st.aborted {
                return Err(Error::resource("multiplexer aborted"));
            }
            let take = if clim >= 0 {
                data.len().min(clim as usize)
            } else {
                data.len()
            };
            let chunks = data.pop_list(take);
            st.out_buf.append_list(chunks);
            (
                st.reactor.clone(),
                st.ext_produced + st.out_buf.len() as i64 + 0x4000,
            )
        };
        sched(&reactor, &self.mux, flush_out);
        Ok(lim)
    }

    fn end_consume(&mut self, clean: bool) {
        let reactor = {
            let mut st = self.mux.borrow_mut();
            if st.ext_sent_eod.is_some() {
                return;
            }
            st.ext_sent_eod = Some(clean);
            st.reactor.clone()
        };
        sched(&reactor, &self.mux, flush_out);
    }

    fn abort(&mut self) {
        abort_all(&self.mux);
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
        if let Some(producer) = self.producer.clone() {
            producer.borrow_mut().can_produce(UNBOUNDED);
        }
    }
}

/// Early-byte multiplexer endpoints.
pub struct VopMultiplexer {
    mux: Mux,
    pub cipher_consume: ConsumerRef,
    pub cipher_produce: ProducerRef,
    /// Inner endpoints handed to the selected transport; held here so
    /// the weak interface references stay valid.
    _wire_producer: ProducerRef,
    _wire_consumer: ConsumerRef,
}

impl VopMultiplexer {
    pub fn new(
        reactor: &LocalReactor,
        enabled: TransportMask,
        selector: TransportSelector,
    ) -> VopMultiplexer {
        let shared = Rc::new(RefCell::new(MuxShared {
            reactor: reactor.clone(),
            enabled,
            selector: Some(selector),
            selected: None,
            pending: Rc::new(ByteBuf::new()),
            inner_consumer: None,
            inner_delivered: 0,
            inner_lim: 0,
            in_eod: None,
            ext_producer: None,
            ext_consumed: 0,
            ext_consume_lim: 0,
            out_buf: Rc::new(ByteBuf::new()),
            ext_consumer: None,
            ext_produced: 0,
            ext_produce_lim: 0,
            ext_sent_eod: None,
            aborted: false,
            wire_producer_iface: None,
            wire_consumer_iface: None,
            ext_consumer_iface: None,
            ext_producer_iface: None,
        }));

        let ext_consumer = Rc::new(RefCell::new(MuxCipherConsumer {
            mux: shared.clone(),
        }));
        let ext_producer = Rc::new(RefCell::new(MuxCipherProducer {
            mux: shared.clone(),
        }));
        let wire_producer = Rc::new(RefCell::new(MuxWireProducer {
            mux: shared.clone(),
        }));
        let wire_consumer = Rc::new(RefCell::new(MuxWireConsumer {
            mux: shared.clone(),
            producer: None,
        }));
        {
            let mut st = shared.borrow_mut();
            st.ext_consumer_iface = Some(
                Rc::downgrade(&ext_consumer) as Weak<RefCell<dyn ByteConsumer>>
            );
            st.ext_producer_iface = Some(
                Rc::downgrade(&ext_producer) as Weak<RefCell<dyn ByteProducer>>
            );
            st.wire_producer_iface = Some(
                Rc::downgrade(&wire_producer) as Weak<RefCell<dyn ByteProducer>>
            );
            st.wire_consumer_iface = Some(
                Rc::downgrade(&wire_consumer) as Weak<RefCell<dyn ByteConsumer>>
            );
        }
        VopMultiplexer {
            mux: shared,
            cipher_consume: ext_consumer,
            cipher_produce: ext_producer,
            _wire_producer: wire_producer,
            _wire_consumer: wire_consumer,
        }
    }

    pub fn selected(&self) -> Option<SelectedTransport> {
        self.mux.borrow().selected
    }
}
