//! Semaphore waiters are served strictly in arrival order.

#![allow(missing_docs)]

#[macro_use]
mod common;

use common::*;
use percore::future::{when_all, yield_now};
use percore::sync::with_semaphore;
use percore::time::sleep;
use percore::{AbortSource, Error, ErrorKind, Future, Semaphore, Time};
use proptest::prelude::*;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

fn init_test(test_name: &str) {
    init_test_logging();
    test_phase!(test_name);
}

type Log = Rc<RefCell<Vec<&'static str>>>;

fn record(sem: &Semaphore, log: &Log, name: &'static str) -> Future<()> {
    let log = Rc::clone(log);
    sem.wait(1).map(move |()| log.borrow_mut().push(name))
}

#[test]
fn signals_release_waiters_in_order() {
    init_test("signals_release_waiters_in_order");
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&log);
    let out = run_virtual(move || {
        let sem = Semaphore::new(2);
        // Both units are held elsewhere.
        assert!(sem.try_wait(2));
        let w1 = record(&sem, &seen, "w1");
        let w2 = record(&sem, &seen, "w2");
        let w3 = record(&sem, &seen, "w3");
        assert_eq!(sem.waiters(), 3);

        let after_two = {
            let sem = sem.clone();
            let seen = Rc::clone(&seen);
            move || {
                sem.signal(1);
                sem.signal(1);
                yield_now().map(move |()| seen.borrow().clone())
            }
        };
        let third = sem.clone();
        yield_now()
            .then(move |()| after_two())
            .then(move |released| {
                assert_eq!(released, vec!["w1", "w2"]);
                assert_eq!(third.waiters(), 1);
                third.signal(1);
                when_all(vec![w1, w2, w3])
            })
    });
    let results = out.expect("all waiters resolved");
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(*log.borrow(), vec!["w1", "w2", "w3"]);
    test_complete!("signals_release_waiters_in_order");
}

#[test]
fn timed_out_head_unblocks_followers() {
    init_test("timed_out_head_unblocks_followers");
    let out = run_virtual(|| {
        let sem = Semaphore::new(1);
        let big = sem.wait_until(5, Time::from_millis(10));
        let small = sem.wait(1);
        big.then_wrapped(move |outcome| {
            assert_eq!(outcome.err().map(|e| e.kind()), Some(ErrorKind::Timeout));
            small.map(move |()| sem.available_units())
        })
    });
    assert_eq!(out.ok(), Some(0));
    test_complete!("timed_out_head_unblocks_followers");
}

#[test]
fn aborted_waiter_leaves_queue() {
    init_test("aborted_waiter_leaves_queue");
    let out = run_virtual(|| {
        let sem = Semaphore::new(0);
        let abort = AbortSource::new();
        let waiting = sem.wait_abortable(1, &abort);
        assert_eq!(sem.waiters(), 1);
        abort.request_abort();
        assert_eq!(sem.waiters(), 0);
        waiting
    });
    assert_err_kind!(out, ErrorKind::Aborted);
}

#[test]
fn with_semaphore_returns_units_on_failure() {
    init_test("with_semaphore_returns_units_on_failure");
    let out = run_virtual(|| {
        let sem = Semaphore::new(3);
        let checker = sem.clone();
        with_semaphore(&sem, 2, move || {
            sleep(Duration::from_millis(1)).then(|()| Future::<()>::failed(Error::user("work failed")))
        })
        .then_wrapped(move |outcome| {
            assert!(outcome.is_err());
            Future::ready(checker.available_units())
        })
    });
    assert_eq!(out.ok(), Some(3));
}

#[test]
fn broken_semaphore_fails_new_waiters() {
    init_test("broken_semaphore_fails_new_waiters");
    let out = run_virtual(|| {
        let sem = Semaphore::new(0);
        let pending = sem.wait(1);
        sem.break_semaphore();
        let late = sem.wait(1);
        pending.then_wrapped(move |first| {
            assert_eq!(first.err().map(|e| e.kind()), Some(ErrorKind::Broken));
            late
        })
    });
    assert_err_kind!(out, ErrorKind::Broken);
    test_complete!("broken_semaphore_fails_new_waiters");
}

#[test]
fn unit_guards_split_and_return() {
    init_test("unit_guards_split_and_return");
    let out = run_virtual(|| {
        let sem = Semaphore::new(4);
        let checker = sem.clone();
        sem.get_units(4).map(move |mut held| {
            let part = held.split(1);
            assert_eq!(held.count(), 3);
            held.return_units(2);
            assert_eq!(checker.available_units(), 2);
            drop(part);
            assert_eq!(checker.available_units(), 3);
            assert_eq!(held.release(), 1);
            checker.available_units()
        })
    });
    assert_eq!(out.ok(), Some(3));
}

proptest! {
    #![proptest_config(test_proptest_config(64))]

    #[test]
    fn released_waiters_form_a_prefix(
        requests in prop::collection::vec(1_usize..5, 1..20),
        signals in prop::collection::vec(0_usize..6, 0..20),
    ) {
        init_test_logging();
        let released = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&released);
        let reqs = requests.clone();
        let sigs = signals.clone();
        let out = run_virtual(move || {
            let sem = Semaphore::new(0);
            let waits: Vec<Future<()>> = reqs
                .iter()
                .enumerate()
                .map(|(i, units)| {
                    let seen = Rc::clone(&seen);
                    sem.wait(*units).map(move |()| seen.borrow_mut().push(i))
                })
                .collect();
            for units in sigs {
                sem.signal(units);
            }
            yield_now().then(move |()| {
                sem.break_semaphore();
                when_all(waits)
            })
        });
        prop_assert!(out.is_ok());

        let total: usize = signals.iter().sum();
        let mut expected = 0;
        let mut used = 0;
        for units in &requests {
            if used + units > total {
                break;
            }
            used += units;
            expected += 1;
        }
        let released = released.borrow();
        prop_assert_eq!(released.len(), expected);
        prop_assert!(released.iter().enumerate().all(|(pos, i)| pos == *i));
    }
}
