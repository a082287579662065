// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! In-memory byte-flow endpoints.
//!
//! A [`BufferSource`] feeds queued bytes into an attached consumer as
//! credit allows; a [`BufferSink`] collects everything it is handed.
//! Both are used to terminate bridge plaintext sides in tests and to
//! replay peeked bytes in the transport multiplexer.

use std::{cell::RefCell, rc::Rc};

use crate::{
    error::{Error, Result},
    io::{
        ByteConsumer, ByteProducer, ConsumerRef, ProducerRef, UNBOUNDED,
        buf::ByteBuf,
    },
};

/// Consumer collecting received bytes, granting credit in fixed steps.
pub struct BufferSink {
    received: Vec<u8>,
    producer: Option<ProducerRef>,
    consumed: i64,
    /// Credit granted beyond what was consumed; negative = unbounded.
    credit_step: i64,
    eod: Option<bool>,
    aborted: bool,
}

impl BufferSink {
    pub fn new(credit_step: i64) -> Rc<RefCell<BufferSink>> {
        Rc::new(RefCell::new(BufferSink {
            received: Vec::new(),
            producer: None,
            consumed: 0,
            credit_step,
            eod: None,
            aborted: false,
        }))
    }

    pub fn unbounded() -> Rc<RefCell<BufferSink>> {
        BufferSink::new(UNBOUNDED)
    }

    pub fn received(&self) -> &[u8] {
        &self.received
    }

    pub fn take_received(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.received)
    }

    pub fn ended(&self) -> Option<bool> {
        self.eod
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    fn current_lim(&self) -> i64 {
        if self.credit_step < 0 {
            UNBOUNDED
        } else {
            self.consumed + self.credit_step
        }
    }
}

impl ByteConsumer for BufferSink {
    fn consume(&mut self, data: &ByteBuf, clim: i64) -> Result<i64> {
        if self.eod.is_some() {
            return Err(Error::resource("consumer already received end-of-data"));
        }
        let mut allowed = if self.credit_step < 0 {
            data.len() as i64
        } else {
            (self.current_lim() - self.consumed).min(data.len() as i64)
        };
        if clim >= 0 {
            allowed = allowed.min(clim);
        }
        let taken = data.pop(allowed.max(0) as usize);
        self.consumed += taken.len() as i64;
        self.received.extend_from_slice(&taken);
        Ok(self.current_lim())
    }

    fn end_consume(&mut self, clean: bool) {
        if self.eod.is_none() {
            self.eod = Some(clean);
        }
    }

    fn abort(&mut self) {
        self.aborted = true;
        self.eod = Some(false);
        self.producer = None;
    }

    fn set_producer(&mut self, producer: ProducerRef) -> Result<()> {
        if self.producer.is_some() {
            return Err(Error::resource("producer already connected"));
        }
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
        let lim = self.current_lim();
        if let Some(producer) = self.producer.clone() {
            producer.borrow_mut().can_produce(lim);
        }
    }
}

/// Producer feeding queued bytes under the consumer's credit.
pub struct BufferSource {
    pending: Rc<ByteBuf>,
    consumer: Option<ConsumerRef>,
    produced: i64,
    produce_lim: i64,
    ended: bool,
    aborted: bool,
}

impl BufferSource {
    pub fn new() -> Rc<RefCell<BufferSource>> {
        Rc::new(RefCell::new(BufferSource {
            pending: Rc::new(ByteBuf::new()),
            consumer: None,
            produced: 0,
            produce_lim: 0,
            ended: false,
            aborted: false,
        }))
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Queues bytes and pushes as much as current credit allows.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.ended || self.aborted {
            return Err(Error::resource("producer already reached end-of-data"));
        }
        self.pending.append_slice(data);
        self.push_now()
    }

    /// Signals end-of-data once the queue drains.
    pub fn end(&mut self, clean: bool) {
        self.ended = true;
        if self.pending.is_empty()
            && let Some(consumer) = self.consumer.clone()
        {
            consumer.borrow_mut().end_consume(clean);
        }
    }

    fn push_now(&mut self) -> Result<()> {
        let Some(consumer) = self.consumer.clone() else {
            return Ok(());
        };
        while !self.pending.is_empty() {
            let room = if self.produce_lim < 0 {
                self.pending.len() as i64
            } else {
                (self.produce_lim - self.produced).max(0)
            };
            if room == 0 {
                break;
            }
            let before = self.pending.len();
            let new_lim = consumer.borrow_mut().consume(&self.pending, room)?;
            let moved = before - self.pending.len();
            self.produced += moved as i64;
            self.produce_lim = new_lim;
            if moved == 0 {
                break;
            }
        }
        if self.ended
            && self.pending.is_empty()
            && let Some(consumer) = self.consumer.clone()
        {
            consumer.borrow_mut().end_consume(true);
        }
        Ok(())
    }
}

impl ByteProducer for BufferSource {
    fn can_produce(&mut self, limit: i64) {
        let raised = if limit < 0 {
            self.produce_lim >= 0
        } else {
            self.produce_lim >= 0 && self.produce_lim < limit
        };
        if raised {
            self.produce_lim = limit;
            if let Err(e) = self.push_now() {
                tracing::debug!("buffer source push failed: {e}");
            }
        }
    }

    fn abort(&mut self) {
        self.aborted = true;
        self.pending.clear();
        self.consumer = None;
    }

    fn set_consumer(&mut self, consumer: ConsumerRef) -> Result<()> {
        if self.consumer.is_some() {
            return Err(Error::resource("consumer already attached"));
        }
        self.produced = 0;
        self.produce_lim = 0;
        self.consumer = Some(consumer);
        Ok(())
    }

    fn clear_consumer(&mut self) {
        self.consumer = None;
        self.produced = 0;
        self.produce_lim = 0;
    }

    fn consumer(&self) -> Option<ConsumerRef> {
        self.consumer.clone()
    }
}
