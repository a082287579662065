// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! TCP socket agent: a reactor descriptor exposing the byte-flow
//! endpoint contract.
//!
//! The write side is a consumer with a bounded buffer; the read side is
//! a producer honoring the attached consumer's credit. Socket errors
//! abort both directions and cascade through the attached flows.

use std::{
    cell::RefCell,
    io::{self, Read, Write},
    rc::{Rc, Weak},
    time::Duration,
};

use mio::{Interest, Registry, Token, net::TcpStream};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    io::{
        ByteConsumer, ByteProducer, ConsumerRef, Control, ControlResult,
        ProducerRef, UNBOUNDED, buf::ByteBuf, credit,
    },
    reactor::{IoHandler, LocalReactor},
};

const READ_CHUNK: usize = 0x4000;

struct SockState {
    reactor: LocalReactor,
    stream: TcpStream,
    token: Option<Token>,

    // Write side (consumer role).
    wbuf: Rc<ByteBuf>,
    wbuf_lim: i64,
    consumed: i64,
    consume_lim: i64,
    in_producer: Option<ProducerRef>,
    in_eod: bool,
    sent_shutdown: bool,

    // Read side (producer role).
    rbuf: Rc<ByteBuf>,
    out_consumer: Option<ConsumerRef>,
    produced: i64,
    produce_lim: i64,
    read_eof: bool,

    aborted: bool,

    consumer_iface: Option<Weak<RefCell<dyn ByteConsumer>>>,
    producer_iface: Option<Weak<RefCell<dyn ByteProducer>>>,
}

/// Endpoint handles of a registered socket agent.
pub struct SocketAgent {
    pub consumer: ConsumerRef,
    pub producer: ProducerRef,
    pub token: Token,
    state: Rc<RefCell<SockState>>,
}

impl SocketAgent {
    /// Registers a connected non-blocking stream with the reactor.
    pub fn register(
        reactor: &LocalReactor,
        stream: TcpStream,
        wbuf_lim: i64,
    ) -> Result<SocketAgent> {
        let state = Rc::new(RefCell::new(SockState {
            reactor: reactor.clone(),
            stream,
            token: None,
            wbuf: Rc::new(ByteBuf::new()),
            wbuf_lim,
            consumed: 0,
            consume_lim: 0,
            in_producer: None,
            in_eod: false,
            sent_shutdown: false,
            rbuf: Rc::new(ByteBuf::new()),
            out_consumer: None,
            produced: 0,
            produce_lim: 0,
            read_eof: false,
            aborted: false,
            consumer_iface: None,
            producer_iface: None,
        }));
        let consumer: ConsumerRef = Rc::new(RefCell::new(SockConsumer {
            state: state.clone(),
        }));
        let producer: ProducerRef = Rc::new(RefCell::new(SockProducer {
            state: state.clone(),
        }));
        state.borrow_mut().consumer_iface =
            Some(Rc::downgrade(&consumer) as Weak<RefCell<dyn ByteConsumer>>);
        state.borrow_mut().producer_iface =
            Some(Rc::downgrade(&producer) as Weak<RefCell<dyn ByteProducer>>);

        let handler: Rc<RefCell<dyn IoHandler>> = state.clone();
        let token = reactor.add_handler(handler, true, true)?;
        state.borrow_mut().token = Some(token);

        Ok(SocketAgent {
            consumer,
            producer,
            token,
            state,
        })
    }

    /// Schedules a read attempt; used after out-of-band credit updates.
    pub fn poke(&self, reactor: &LocalReactor) {
        schedule_read(reactor, &self.state);
    }
}

fn schedule_read(reactor: &LocalReactor, state: &Rc<RefCell<SockState>>) {
    let weak = Rc::downgrade(state);
    let local = reactor.clone();
    reactor.schedule(Duration::ZERO, move || {
        if let Some(state) = weak.upgrade() {
            state.borrow_mut().do_read(&local);
        }
    });
}

fn schedule_write(reactor: &LocalReactor, state: &Rc<RefCell<SockState>>) {
    let weak = Rc::downgrade(state);
    let local = reactor.clone();
    reactor.schedule(Duration::ZERO, move || {
        if let Some(state) = weak.upgrade() {
            state.borrow_mut().do_write(&local);
        }
    });
}

impl SockState {
    fn write_space(&self) -> i64 {
        credit(self.wbuf.len() as i64, &[self.wbuf_lim])
    }

    fn drain_write(&mut self) -> io::Result<()> {
        while !self.wbuf.is_empty() {
            let chunk = self.wbuf.peek(READ_CHUNK);
            match self.stream.write(&chunk) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.wbuf.remove(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if self.in_eod && self.wbuf.is_empty() && !self.sent_shutdown {
            self.sent_shutdown = true;
            let _ = self.stream.shutdown(std::net::Shutdown::Write);
        }
        Ok(())
    }

    fn abort_connection(&mut self) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        self.wbuf.clear();
        self.rbuf.clear();
        self.in_eod = true;
        self.read_eof = true;
        if let Some(token) = self.token.take() {
            // Deregister directly: remove_handler would re-borrow this
            // state through the handler entry.
            self.reactor.forget_handler(token);
            if let Ok(registry) = self.reactor.registry() {
                let _ = registry.deregister(&mut self.stream);
            }
        }
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

impl IoHandler for SockState {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        registry.register(&mut self.stream, token, interest)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        registry.reregister(&mut self.stream, token, interest)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    fn do_read(&mut self, _reactor: &LocalReactor) {
        if self.aborted || self.read_eof {
            return;
        }
        let mut scratch = [0u8; READ_CHUNK];
        loop {
            let Some(consumer) = self
                .out_consumer
                .clone()
            else {
                return;
            };
            let room = credit(self.produced, &[self.produce_lim]);
            if room == 0 {
                return;
            }
            let max = if room < 0 {
                scratch.len()
            } else {
                scratch.len().min(room as usize)
            };
            match self.stream.read(&mut scratch[..max]) {
                Ok(0) => {
                    self.read_eof = true;
                    // Deferred: the end may cascade back into this
                    // handler, which the loop still holds borrowed.
                    let _ = self.reactor.schedule(Duration::ZERO, move || {
                        consumer.borrow_mut().end_consume(true);
                    });
                    return;
                },
                Ok(n) => {
                    self.rbuf.append_slice(&scratch[..n]);
                    let before = self.rbuf.len();
                    let result =
                        consumer.borrow_mut().consume(&self.rbuf, UNBOUNDED);
                    let delivered = before - self.rbuf.len();
                    self.produced += delivered as i64;
                    match result {
                        Ok(new_lim) => self.produce_lim = new_lim,
                        Err(e) => {
                            warn!("socket consumer failed: {e}");
                            self.abort_flows();
                            return;
                        },
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("socket read failed: {e}");
                    self.abort_flows();
                    return;
                },
            }
        }
    }

    fn do_write(&mut self, _reactor: &LocalReactor) {
        if self.aborted {
            return;
        }
        if let Err(e) = self.drain_write() {
            debug!("socket write failed: {e}");
            self.abort_flows();
            return;
        }
        // Freed buffer space extends the upstream producer's credit.
        // Deferred through the loop: this handler may run while the
        // producer is mid-call.
        let space = self.write_space();
        if space != 0
            && let Some(producer) = self.in_producer.clone()
        {
            let new_lim = if space < 0 {
                UNBOUNDED
            } else {
                self.consumed + space
            };
            if new_lim != self.consume_lim || new_lim < 0 {
                self.consume_lim = new_lim;
                let _ = self.reactor.schedule(Duration::ZERO, move || {
                    producer.borrow_mut().can_produce(new_lim);
                });
            }
        }
    }

    fn close_io(&mut self, _reactor: &LocalReactor, err: Option<io::Error>) {
        if let Some(err) = err {
            debug!("socket closed by reactor: {err}");
        }
        self.abort_flows();
    }
}

impl SockState {
    /// Tears the connection down and cascades to both attached flows.
    ///
    /// The cascade is deferred through the reactor so it never runs
    /// while this state is borrowed.
    fn abort_flows(&mut self) {
        if self.aborted {
            return;
        }
        self.abort_connection();
        let producer = self.in_producer.take();
        let consumer = self.out_consumer.take();
        if producer.is_none() && consumer.is_none() {
            return;
        }
        let _ = self.reactor.schedule(Duration::ZERO, move || {
            if let Some(producer) = producer {
                producer.borrow_mut().abort();
                producer.borrow_mut().clear_consumer();
            }
            if let Some(consumer) = consumer {
                consumer.borrow_mut().abort();
                consumer.borrow_mut().clear_producer();
            }
        });
    }
}

struct SockConsumer {
    state: Rc<RefCell<SockState>>,
}

impl ByteConsumer for SockConsumer {
    fn consume(&mut self, data: &ByteBuf, clim: i64) -> Result<i64> {
        let mut write_err = None;
        let (new_lim, reactor, buffered) = {
            let mut state = self.state.borrow_mut();
            if state.in_eod {
                return Err(Error::resource("consumer already received end-of-data"));
            }
            if state.in_producer.is_none() {
                return Err(Error::resource("no connected producer"));
            }
            if data.is_empty() {
                return Err(Error::resource("no data to consume"));
            }
            let mut max_cons = credit(state.consumed, &[state.consume_lim]);
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
            state.wbuf.append_list(chunks);
            state.consumed += take as i64;

            if let Err(e) = state.drain_write() {
                write_err = Some(e);
            }

            let space = state.write_space();
            state.consume_lim = if space < 0 {
                UNBOUNDED
            } else {
                state.consumed + space
            };
            (
                state.consume_lim,
                state.reactor.clone(),
                !state.wbuf.is_empty(),
            )
        };
        if let Some(e) = write_err {
            debug!("socket write failed: {e}");
            self.state.borrow_mut().abort_flows();
            return Err(Error::Io(e));
        }
        // A short write leaves data buffered; let the loop retry.
        if buffered {
            schedule_write(&reactor, &self.state);
        }
        Ok(new_lim)
    }

    fn end_consume(&mut self, clean: bool) {
        let mut state = self.state.borrow_mut();
        if state.in_eod {
            return;
        }
        debug!(clean, "socket write side got end-of-data");
        state.in_eod = true;
        if state.wbuf.is_empty() && !state.sent_shutdown {
            state.sent_shutdown = true;
            let _ = state.stream.shutdown(std::net::Shutdown::Write);
        }
    }

    fn abort(&mut self) {
        self.state.borrow_mut().abort_flows();
    }

    fn set_producer(&mut self, producer: ProducerRef) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.in_eod {
            return Err(Error::resource("consumer already received end-of-data"));
        }
        if state.in_producer.is_some() {
            return Err(Error::resource("producer already connected"));
        }
        state.consumed = 0;
        state.consume_lim = 0;
        state.in_producer = Some(producer);
        Ok(())
    }

    fn clear_producer(&mut self) {
        let mut state = self.state.borrow_mut();
        state.in_producer = None;
        state.consumed = 0;
        state.consume_lim = 0;
    }

    fn producer(&self) -> Option<ProducerRef> {
        self.state.borrow().in_producer.clone()
    }

    fn on_attached(&mut self) {
        // Grant initial write-buffer credit to the new producer.
        let (producer, lim) = {
            let mut state = self.state.borrow_mut();
            let space = state.write_space();
            state.consume_lim = if space < 0 {
                UNBOUNDED
            } else {
                state.consumed + space
            };
            (state.in_producer.clone(), state.consume_lim)
        };
        if let Some(producer) = producer {
            producer.borrow_mut().can_produce(lim);
        }
    }

    fn control(&mut self, _msg: Control) -> ControlResult {
        ControlResult::Unhandled
    }

    fn reverse(&self) -> Option<ProducerRef> {
        self.state
            .borrow()
            .producer_iface
            .as_ref()
            .and_then(Weak::upgrade)
    }
}

struct SockProducer {
    state: Rc<RefCell<SockState>>,
}

impl ByteProducer for SockProducer {
    fn can_produce(&mut self, limit: i64) {
        let (reactor, changed) = {
            let mut state = self.state.borrow_mut();
            let changed = if limit < 0 {
                if state.produce_lim >= 0 {
                    state.produce_lim = UNBOUNDED;
                    true
                } else {
                    false
                }
            } else if state.produce_lim >= 0 && state.produce_lim < limit {
                state.produce_lim = limit;
                true
            } else {
                false
            };
            (state.reactor.clone(), changed)
        };
        if changed {
            schedule_read(&reactor, &self.state);
        }
    }

    fn abort(&mut self) {
        self.state.borrow_mut().abort_flows();
    }

    fn set_consumer(&mut self, consumer: ConsumerRef) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.read_eof {
            return Err(Error::resource("producer already reached end-of-data"));
        }
        if state.out_consumer.is_some() {
            return Err(Error::resource("consumer already attached"));
        }
        state.produced = 0;
        state.produce_lim = 0;
        state.out_consumer = Some(consumer);
        Ok(())
    }

    fn clear_consumer(&mut self) {
        let mut state = self.state.borrow_mut();
        state.out_consumer = None;
        state.produced = 0;
        state.produce_lim = 0;
    }

    fn consumer(&self) -> Option<ConsumerRef> {
        self.state.borrow().out_consumer.clone()
    }

    fn control(&mut self, _msg: Control) -> ControlResult {
        ControlResult::Unhandled
    }

    fn reverse(&self) -> Option<ConsumerRef> {
        self.state
            .borrow()
            .consumer_iface
            .as_ref()
            .and_then(Weak::upgrade)
    }
}
