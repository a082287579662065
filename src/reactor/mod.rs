// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Single-threaded cooperative event loop.
//!
//! All descriptor handlers and scheduled calls run on the thread that
//! drives [`Reactor::run`]. The only blocking point is the poll wait,
//! bounded by the next scheduled-call deadline. Other threads reach the
//! loop exclusively through [`ReactorHandle`]: requests are queued
//! under a lock and the loop is woken through a [`mio::Waker`], the
//! self-pipe equivalent on every supported platform. Messages drain in
//! FIFO order; scheduled calls with equal deadlines fire in submission
//! order.

use std::{
    cell::RefCell,
    collections::{BinaryHeap, HashMap, VecDeque},
    io,
    panic::{AssertUnwindSafe, catch_unwind},
    rc::{Rc, Weak},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::error::{Error, Result};

const WAKER_TOKEN: Token = Token(0);

/// Reactor-side handler for one registered descriptor.
pub trait IoHandler {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()>;

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()>;

    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;

    fn do_read(&mut self, reactor: &LocalReactor);

    fn do_write(&mut self, reactor: &LocalReactor);

    /// Invoked when the descriptor failed or was dropped by the loop.
    fn close_io(&mut self, reactor: &LocalReactor, err: Option<io::Error>);
}

struct CallEntry {
    flag: Arc<AtomicBool>,
    group: Option<String>,
    callback: Option<Box<dyn FnOnce()>>,
}

struct HeapItem {
    time: Instant,
    seq: u64,
    entry: Rc<RefCell<CallEntry>>,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so the binary heap pops the earliest (time, seq).
        (other.time, other.seq).cmp(&(self.time, self.seq))
    }
}

/// Cancellation handle for a scheduled call. Cloneable and usable from
/// any thread; cancelling is idempotent and a cancelled call is
/// silently skipped when its deadline fires.
#[derive(Clone)]
pub struct CallHandle {
    flag: Arc<AtomicBool>,
}

impl CallHandle {
    pub fn cancel(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn active(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

struct HandlerEntry {
    handler: Rc<RefCell<dyn IoHandler>>,
    read: bool,
    write: bool,
    registered: bool,
}

struct Core {
    registry: Registry,
    calls: BinaryHeap<HeapItem>,
    seq: u64,
    groups: HashMap<String, Vec<Weak<RefCell<CallEntry>>>>,
    handlers: HashMap<Token, HandlerEntry>,
    next_token: usize,
}

enum Message {
    Execute(Box<dyn FnOnce(&LocalReactor) + Send>),
    Stop,
}

struct Shared {
    queue: Mutex<VecDeque<Message>>,
    waker: Waker,
    stopped: AtomicBool,
}

impl Shared {
    fn push(&self, msg: Message) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::resource("reactor stopped"));
        }
        self.queue.lock().push_back(msg);
        self.waker.wake().map_err(Error::Io)?;
        Ok(())
    }

    fn take_all(&self) -> VecDeque<Message> {
        std::mem::take(&mut *self.queue.lock())
    }
}

/// Cross-thread handle: requests serialize through the message queue
/// and wake the loop.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl ReactorHandle {
    /// Runs `f` on the reactor thread as soon as the loop gets to it.
    pub fn execute(
        &self,
        f: impl FnOnce(&LocalReactor) + Send + 'static,
    ) -> Result<()> {
        self.shared.push(Message::Execute(Box::new(f)))
    }

    /// Schedules a call on the reactor thread after `delay`.
    pub fn schedule(
        &self,
        delay: Duration,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        self.execute(move |reactor| {
            reactor.schedule(delay, f);
        })
    }

    pub fn stop(&self) {
        let _ = self.shared.push(Message::Stop);
    }
}

/// Reactor-thread handle used by bridges and descriptor handlers. Not
/// sendable; off-thread callers go through [`ReactorHandle`].
#[derive(Clone)]
pub struct LocalReactor {
    core: Rc<RefCell<Core>>,
    shared: Arc<Shared>,
}

impl LocalReactor {
    pub fn time(&self) -> Instant {
        Instant::now()
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn schedule(&self, delay: Duration, f: impl FnOnce() + 'static) -> CallHandle {
        self.cg_schedule(delay, None, f)
    }

    /// Schedules a call, optionally under a call group.
    pub fn cg_schedule(
        &self,
        delay: Duration,
        group: Option<&str>,
        f: impl FnOnce() + 'static,
    ) -> CallHandle {
        let flag = Arc::new(AtomicBool::new(true));
        let entry = Rc::new(RefCell::new(CallEntry {
            flag: flag.clone(),
            group: group.map(str::to_string),
            callback: Some(Box::new(f)),
        }));
        let mut core = self.core.borrow_mut();
        core.seq += 1;
        let item = HeapItem {
            time: Instant::now() + delay,
            seq: core.seq,
            entry: entry.clone(),
        };
        if let Some(group) = group {
            core.groups
                .entry(group.to_string())
                .or_default()
                .push(Rc::downgrade(&entry));
        }
        core.calls.push(item);
        CallHandle { flag }
    }

    /// Cancels a call and releases its bound closure right away.
    pub fn cancel_call(&self, handle: &CallHandle) {
        handle.cancel();
        let core = self.core.borrow();
        for item in core.calls.iter() {
            let mut entry = item.entry.borrow_mut();
            if Arc::ptr_eq(&entry.flag, &handle.flag) {
                entry.callback = None;
            }
        }
    }

    /// Cancels every member of a call group atomically.
    pub fn cg_cancel(&self, group: &str) {
        let members = {
            let mut core = self.core.borrow_mut();
            core.groups.remove(group)
        };
        let Some(members) = members else {
            return;
        };
        for member in members {
            if let Some(entry) = member.upgrade() {
                let mut entry = entry.borrow_mut();
                entry.flag.store(false, Ordering::SeqCst);
                entry.callback = None;
            }
        }
    }

    /// Registers a descriptor handler with the given initial sides.
    pub fn add_handler(
        &self,
        handler: Rc<RefCell<dyn IoHandler>>,
        read: bool,
        write: bool,
    ) -> Result<Token> {
        let mut core = self.core.borrow_mut();
        core.next_token += 1;
        let token = Token(core.next_token);
        let mut entry = HandlerEntry {
            handler: handler.clone(),
            read,
            write,
            registered: false,
        };
        if read || write {
            handler
                .borrow_mut()
                .register(&core.registry, token, interest_for(read, write))
                .map_err(Error::Io)?;
            entry.registered = true;
        }
        core.handlers.insert(token, entry);
        Ok(token)
    }

    pub fn add_reader(&self, token: Token) -> Result<()> {
        self.set_sides(token, Some(true), None)
    }

    pub fn remove_reader(&self, token: Token) -> Result<()> {
        self.set_sides(token, Some(false), None)
    }

    pub fn add_writer(&self, token: Token) -> Result<()> {
        self.set_sides(token, None, Some(true))
    }

    pub fn remove_writer(&self, token: Token) -> Result<()> {
        self.set_sides(token, None, Some(false))
    }

    fn set_sides(
        &self,
        token: Token,
        read: Option<bool>,
        write: Option<bool>,
    ) -> Result<()> {
        let mut core = self.core.borrow_mut();
        let registry = core.registry.try_clone().map_err(Error::Io)?;
        let Some(entry) = core.handlers.get_mut(&token) else {
            return Err(Error::resource("unknown descriptor token"));
        };
        let new_read = read.unwrap_or(entry.read);
        let new_write = write.unwrap_or(entry.write);
        if new_read == entry.read && new_write == entry.write {
            return Ok(());
        }
        let handler = entry.handler.clone();
        if new_read || new_write {
            let interest = interest_for(new_read, new_write);
            let result = if entry.registered {
                handler.borrow_mut().reregister(&registry, token, interest)
            } else {
                handler.borrow_mut().register(&registry, token, interest)
            };
            result.map_err(Error::Io)?;
            entry.registered = true;
        } else if entry.registered {
            handler
                .borrow_mut()
                .deregister(&registry)
                .map_err(Error::Io)?;
            entry.registered = false;
        }
        entry.read = new_read;
        entry.write = new_write;
        Ok(())
    }

    /// Unregisters a handler without invoking its close hook.
    pub fn remove_handler(&self, token: Token) -> Result<()> {
        let entry = {
            let mut core = self.core.borrow_mut();
            core.handlers.remove(&token)
        };
        if let Some(entry) = entry
            && entry.registered
        {
            let registry = self.core.borrow().registry.try_clone().map_err(Error::Io)?;
            entry
                .handler
                .borrow_mut()
                .deregister(&registry)
                .map_err(Error::Io)?;
        }
        Ok(())
    }

    /// Drops a handler entry without touching its registration. Used
    /// by descriptor owners tearing themselves down from inside a
    /// handler callback, where [`LocalReactor::remove_handler`] would
    /// re-enter their state.
    pub fn forget_handler(&self, token: Token) {
        let mut core = self.core.borrow_mut();
        core.handlers.remove(&token);
    }

    /// A handle to the poll registry, for descriptor owners that
    /// manage their own registration.
    pub fn registry(&self) -> Result<Registry> {
        self.core.borrow().registry.try_clone().map_err(Error::Io)
    }

    pub fn stop(&self) {
        let _ = self.shared.push(Message::Stop);
    }
}

fn interest_for(read: bool, write: bool) -> Interest {
    match (read, write) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (false, true) => Interest::WRITABLE,
        // Registration is skipped entirely when both sides are off.
        _ => Interest::READABLE,
    }
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    core: Rc<RefCell<Core>>,
    shared: Arc<Shared>,
    startup: Vec<Box<dyn FnOnce()>>,
    stopped: bool,
}

impl Reactor {
    pub fn new() -> Result<Self> {
        let poll = Poll::new().map_err(Error::Io)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(Error::Io)?;
        let registry = poll.registry().try_clone().map_err(Error::Io)?;
        let core = Rc::new(RefCell::new(Core {
            registry,
            calls: BinaryHeap::new(),
            seq: 0,
            groups: HashMap::new(),
            handlers: HashMap::new(),
            next_token: WAKER_TOKEN.0,
        }));
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            waker,
            stopped: AtomicBool::new(false),
        });
        Ok(Reactor {
            poll,
            events: Events::with_capacity(256),
            core,
            shared,
            startup: Vec::new(),
            stopped: false,
        })
    }

    pub fn local(&self) -> LocalReactor {
        LocalReactor {
            core: self.core.clone(),
            shared: self.shared.clone(),
        }
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shared: self.shared.clone(),
        }
    }

    /// Queues a closure to run when the loop starts.
    pub fn call_when_running(&mut self, f: impl FnOnce() + 'static) {
        self.startup.push(Box::new(f));
    }

    /// Runs the event loop until [`ReactorHandle::stop`] is called.
    pub fn run(&mut self) -> Result<()> {
        debug!("reactor started");
        for f in std::mem::take(&mut self.startup) {
            f();
        }
        let result = loop {
            match self.loop_once(None) {
                Ok(true) => {},
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.shutdown();
        debug!("reactor finished");
        result
    }

    /// Drives one poll iteration. `max_wait` bounds the poll timeout on
    /// top of the next-timer deadline; returns false once stopped.
    pub fn loop_once(&mut self, max_wait: Option<Duration>) -> Result<bool> {
        if self.stopped {
            return Ok(false);
        }
        let local = self.local();

        let next_call = self
            .core
            .borrow()
            .calls
            .peek()
            .map(|item| item.time.saturating_duration_since(Instant::now()));
        let timeout = match (next_call, max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {},
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return Err(Error::Io(e)),
        }

        for event in self.events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                for msg in self.shared.take_all() {
                    match msg {
                        Message::Execute(f) => f(&local),
                        Message::Stop => {
                            self.stopped = true;
                        },
                    }
                }
                if self.stopped {
                    return Ok(false);
                }
                continue;
            }

            let entry = {
                let core = self.core.borrow();
                core.handlers
                    .get(&token)
                    .map(|e| (e.handler.clone(), e.read, e.write))
            };
            let Some((handler, read, write)) = entry else {
                continue;
            };

            if event.is_error() {
                // Drop the descriptor from both sides, then fire the
                // close hook.
                let removed = {
                    let mut core = self.core.borrow_mut();
                    core.handlers.remove(&token)
                };
                if let Some(removed) = removed {
                    if removed.registered {
                        let registry = self.core.borrow().registry.try_clone();
                        if let Ok(registry) = registry {
                            let _ =
                                removed.handler.borrow_mut().deregister(&registry);
                        }
                    }
                    removed.handler.borrow_mut().close_io(&local, None);
                }
                continue;
            }

            if (event.is_readable() || event.is_read_closed()) && read {
                handler.borrow_mut().do_read(&local);
            }
            if event.is_writable() && write {
                handler.borrow_mut().do_write(&local);
            }
        }

        self.run_due_calls(&local);
        Ok(true)
    }

    fn run_due_calls(&mut self, local: &LocalReactor) {
        let due = {
            let mut core = self.core.borrow_mut();
            let now = Instant::now();
            let mut due = Vec::new();
            while let Some(item) = core.calls.peek() {
                if item.time <= now {
                    let item = core.calls.pop().expect("peeked heap entry");
                    due.push(item);
                } else {
                    break;
                }
            }
            // Remove popped calls from their group index first.
            for item in &due {
                let group = item.entry.borrow().group.clone();
                if let Some(group) = group {
                    if let Some(members) = core.groups.get_mut(&group) {
                        members.retain(|w| {
                            w.upgrade()
                                .is_some_and(|e| !Rc::ptr_eq(&e, &item.entry))
                        });
                        if members.is_empty() {
                            core.groups.remove(&group);
                        }
                    }
                }
            }
            due
        };

        for item in due {
            let (active, callback) = {
                let mut entry = item.entry.borrow_mut();
                (entry.flag.load(Ordering::SeqCst), entry.callback.take())
            };
            if !active {
                trace!("skipping cancelled call");
                continue;
            }
            let Some(callback) = callback else {
                continue;
            };
            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                error!("scheduled call failed");
            }
        }
    }

    fn shutdown(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        let handlers = {
            let mut core = self.core.borrow_mut();
            core.calls.clear();
            core.groups.clear();
            std::mem::take(&mut core.handlers)
        };
        let registry = self.core.borrow().registry.try_clone();
        for (_, entry) in handlers {
            if entry.registered
                && let Ok(registry) = &registry
            {
                let _ = entry.handler.borrow_mut().deregister(registry);
            }
        }
    }
}
