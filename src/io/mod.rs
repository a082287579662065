// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Byte-flow fabric: producer/consumer endpoint contracts.
//!
//! A consumer grants credit as an absolute byte count (`clim`); a
//! negative credit means unbounded. Attachment is symmetric and is
//! performed through [`link`]; either side can [`unlink`] without
//! tearing the other down, while `abort` cascades across two-way
//! endpoint pairs. Endpoints are single-threaded objects owned by the
//! reactor thread and addressed through `Rc<RefCell<_>>` handles.
//!
//! The discipline for implementors: never call into another endpoint
//! while holding your own state borrow. Collect what you need, drop
//! the borrow, then make the call.

pub mod buf;
pub mod sock;
pub mod util;

use std::{cell::RefCell, rc::Rc};

use crate::{
    crypto::rsa::RsaKey,
    error::Result,
    io::buf::ByteBuf,
    x509::{cert::Certificate, name::Name},
};

/// Credit value meaning "no limit".
pub const UNBOUNDED: i64 = -1;

pub type ConsumerRef = Rc<RefCell<dyn ByteConsumer>>;
pub type ProducerRef = Rc<RefCell<dyn ByteProducer>>;

/// Peer credentials delivered over the control channel once a secure
/// channel has authenticated its peer.
#[derive(Clone)]
pub struct PeerCredentials {
    pub key: Option<RsaKey>,
    pub identity: Option<Name>,
    pub certificates: Vec<Certificate>,
    pub protocol: &'static str,
}

/// Out-of-band control messages between linked endpoints.
#[derive(Clone)]
pub enum Control {
    ConsumerAttached(ConsumerRef),
    ProducerAttached(ProducerRef),
    RequestProducerState(ConsumerRef),
    Authorize(PeerCredentials),
}

/// Outcome of a control delivery. A missing control handler reports
/// [`ControlResult::Unhandled`], which callers treat as a no-op.
pub enum ControlResult {
    Unhandled,
    Handled,
    Authorized(bool),
}

pub trait ByteConsumer {
    /// Consumes bytes from `data` (bounded by `clim` when
    /// non-negative) and returns the new absolute consume limit.
    fn consume(&mut self, data: &ByteBuf, clim: i64) -> Result<i64>;

    /// Producer-side end of data; `clean` distinguishes graceful
    /// shutdown from a failed peer.
    fn end_consume(&mut self, clean: bool);

    fn abort(&mut self);

    fn set_producer(&mut self, producer: ProducerRef) -> Result<()>;

    fn clear_producer(&mut self);

    fn producer(&self) -> Option<ProducerRef>;

    /// Post-link hook; runs with no endpoint borrows held.
    fn on_attached(&mut self) {}

    fn control(&mut self, _msg: Control) -> ControlResult {
        ControlResult::Unhandled
    }

    /// The paired producer on a two-way endpoint.
    fn reverse(&self) -> Option<ProducerRef> {
        None
    }
}

pub trait ByteProducer {
    /// Forward-capacity signal: the consumer allows production up to
    /// the absolute count `limit` (negative for unbounded).
    fn can_produce(&mut self, limit: i64);

    fn abort(&mut self);

    fn set_consumer(&mut self, consumer: ConsumerRef) -> Result<()>;

    fn clear_consumer(&mut self);

    fn consumer(&self) -> Option<ConsumerRef>;

    fn on_attached(&mut self) {}

    fn control(&mut self, _msg: Control) -> ControlResult {
        ControlResult::Unhandled
    }

    /// The paired consumer on a two-way endpoint.
    fn reverse(&self) -> Option<ConsumerRef> {
        None
    }
}

/// Symmetric attach: wires both directions, runs the post-link hooks,
/// and delivers the attachment control notifications.
pub fn link(consumer: &ConsumerRef, producer: &ProducerRef) -> Result<()> {
    {
        let mut c = consumer.borrow_mut();
        if let Some(existing) = c.producer()
            && Rc::ptr_eq(&existing, producer)
        {
            return Ok(());
        }
        c.set_producer(producer.clone())?;
    }
    producer.borrow_mut().set_consumer(consumer.clone())?;
    consumer.borrow_mut().on_attached();
    producer.borrow_mut().on_attached();
    let _ = producer
        .borrow_mut()
        .control(Control::ConsumerAttached(consumer.clone()));
    let _ = consumer
        .borrow_mut()
        .control(Control::ProducerAttached(producer.clone()));
    Ok(())
}

/// Detaches a consumer from its producer, both directions.
pub fn unlink(consumer: &ConsumerRef) {
    let producer = {
        let mut c = consumer.borrow_mut();
        let p = c.producer();
        c.clear_producer();
        p
    };
    if let Some(producer) = producer {
        producer.borrow_mut().clear_consumer();
    }
}

/// Remaining credit for `base` bytes already moved under the smallest
/// of `lims`; negative limits mean unbounded and -1 is returned when
/// every limit is unbounded.
pub fn credit(base: i64, lims: &[i64]) -> i64 {
    let mut result = UNBOUNDED;
    for &lim in lims {
        if lim >= 0 {
            let left = (lim - base).max(0);
            result = if result < 0 { left } else { result.min(left) };
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credit_combines_limits() {
        assert_eq!(credit(0, &[UNBOUNDED]), UNBOUNDED);
        assert_eq!(credit(10, &[25]), 15);
        assert_eq!(credit(10, &[25, UNBOUNDED, 12]), 2);
        assert_eq!(credit(30, &[25]), 0);
        assert_eq!(credit(0, &[]), UNBOUNDED);
    }
}
