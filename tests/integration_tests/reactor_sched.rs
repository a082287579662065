// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    cell::RefCell,
    rc::Rc,
    sync::mpsc,
    time::Duration,
};

use vts_channel_rs::reactor::Reactor;

use crate::integration_tests::common::pump_until;

#[test]
fn calls_fire_in_deadline_order() {
    let mut reactor = Reactor::new().expect("reactor");
    let local = reactor.local();
    let order = Rc::new(RefCell::new(Vec::new()));

    for (delay_ms, label) in [(30u64, 3u32), (10, 1), (20, 2)] {
        let order = order.clone();
        local.schedule(Duration::from_millis(delay_ms), move || {
            order.borrow_mut().push(label);
        });
    }

    assert!(pump_until(&mut reactor, Duration::from_secs(2), || {
        order.borrow().len() == 3
    }));
    assert_eq!(*order.borrow(), vec![1, 2, 3]);
}

#[test]
fn equal_deadlines_fire_in_submission_order() {
    let mut reactor = Reactor::new().expect("reactor");
    let local = reactor.local();
    let order = Rc::new(RefCell::new(Vec::new()));

    for label in 0..5u32 {
        let order = order.clone();
        local.schedule(Duration::ZERO, move || {
            order.borrow_mut().push(label);
        });
    }

    assert!(pump_until(&mut reactor, Duration::from_secs(1), || {
        order.borrow().len() == 5
    }));
    assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn cancelled_call_is_skipped() {
    let mut reactor = Reactor::new().expect("reactor");
    let local = reactor.local();
    let fired = Rc::new(RefCell::new(Vec::new()));

    let handle = {
        let fired = fired.clone();
        local.schedule(Duration::from_millis(5), move || {
            fired.borrow_mut().push("cancelled");
        })
    };
    {
        let fired = fired.clone();
        local.schedule(Duration::from_millis(10), move || {
            fired.borrow_mut().push("kept");
        });
    }
    local.cancel_call(&handle);
    // Cancelling twice is a no-op.
    handle.cancel();
    assert!(!handle.active());

    assert!(pump_until(&mut reactor, Duration::from_secs(1), || {
        !fired.borrow().is_empty()
    }));
    assert_eq!(*fired.borrow(), vec!["kept"]);
}

#[test]
fn call_group_cancels_atomically() {
    let mut reactor = Reactor::new().expect("reactor");
    let local = reactor.local();
    let fired = Rc::new(RefCell::new(Vec::new()));

    for i in 0..3u32 {
        let fired = fired.clone();
        local.cg_schedule(Duration::from_millis(5), Some("doomed"), move || {
            fired.borrow_mut().push(format!("group-{i}"));
        });
    }
    {
        let fired = fired.clone();
        local.schedule(Duration::from_millis(8), move || {
            fired.borrow_mut().push("solo".to_string());
        });
    }
    local.cg_cancel("doomed");

    assert!(pump_until(&mut reactor, Duration::from_secs(1), || {
        !fired.borrow().is_empty()
    }));
    assert_eq!(*fired.borrow(), vec!["solo".to_string()]);
}

#[test]
fn cross_thread_execute_runs_on_loop() {
    let mut reactor = Reactor::new().expect("reactor");
    let handle = reactor.handle();
    let (tx, rx) = mpsc::channel();

    let worker = std::thread::spawn(move || {
        handle
            .execute(move |_reactor| {
                tx.send(42u32).expect("send");
            })
            .expect("execute");
    });

    let mut got = None;
    assert!(pump_until(&mut reactor, Duration::from_secs(2), || {
        if got.is_none() {
            got = rx.try_recv().ok();
        }
        got.is_some()
    }));
    worker.join().expect("worker join");
    assert_eq!(got, Some(42));
}

#[test]
fn stop_terminates_run() {
    let mut reactor = Reactor::new().expect("reactor");
    let handle = reactor.handle();

    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        handle.stop();
    });

    reactor.run().expect("run until stop");
    stopper.join().expect("stopper join");
}

#[test]
fn panicking_call_does_not_kill_the_loop() {
    let mut reactor = Reactor::new().expect("reactor");
    let local = reactor.local();
    let fired = Rc::new(RefCell::new(false));

    local.schedule(Duration::from_millis(2), || {
        panic!("scheduled call blew up");
    });
    {
        let fired = fired.clone();
        local.schedule(Duration::from_millis(5), move || {
            *fired.borrow_mut() = true;
        });
    }

    assert!(pump_until(&mut reactor, Duration::from_secs(1), || {
        *fired.borrow()
    }));
}
