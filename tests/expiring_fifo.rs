//! Waiter queues whose entries leave on deadlines or aborts.

#![allow(missing_docs)]

#[macro_use]
mod common;

use common::*;
use percore::sync::{AbortSource, AbortableFifo, ExpiringFifo, Expiry};
use percore::time::sleep;
use percore::Time;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

fn init_test(test_name: &str) {
    init_test_logging();
    test_phase!(test_name);
}

#[test]
fn deadlines_expire_in_time_order() {
    init_test("deadlines_expire_in_time_order");
    let expired = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&expired);
    let survivors = run_virtual(move || {
        let fifo = ExpiringFifo::new(move |item: &'static str, why| log.borrow_mut().push((item, why)));
        fifo.push_back_until("late", Time::from_millis(30)).expect("armed");
        fifo.push_back("forever");
        fifo.push_back_until("early", Time::from_millis(10)).expect("armed");
        fifo.push_back_until("never", Time::MAX).expect("no timer");
        sleep(Duration::from_millis(20)).map(move |()| {
            let mut left = Vec::new();
            while let Some(item) = fifo.pop_front() {
                left.push(item);
            }
            left
        })
    })
    .expect("reactor finished");
    assert_eq!(survivors, vec!["late", "forever", "never"]);
    assert_eq!(*expired.borrow(), vec![("early", Expiry::Timeout)]);
    test_complete!("deadlines_expire_in_time_order");
}

#[test]
fn popped_entries_never_expire() {
    init_test("popped_entries_never_expire");
    let expired = Rc::new(RefCell::new(0));
    let count = Rc::clone(&expired);
    let out = run_virtual(move || {
        let fifo = ExpiringFifo::new(move |_: u32, _| *count.borrow_mut() += 1);
        fifo.push_back_until(1, Time::from_millis(5)).expect("armed");
        let first = fifo.pop_front();
        sleep(Duration::from_millis(10)).map(move |()| (first, fifo.len()))
    });
    assert_eq!(out.ok(), Some((Some(1), 0)));
    assert_eq!(*expired.borrow(), 0);
}

#[test]
fn abort_removes_only_its_entry() {
    init_test("abort_removes_only_its_entry");
    let aborted = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&aborted);
    let fifo = AbortableFifo::new(move |item: char| log.borrow_mut().push(item));
    let source = AbortSource::new();
    fifo.push_back('a');
    let b = fifo.push_back_abortable('b', &source).expect("not aborted yet");
    fifo.push_back('c');
    source.request_abort();
    assert_eq!(*aborted.borrow(), vec!['b']);
    assert_eq!(fifo.remove(b), None);
    assert_eq!(fifo.len(), 2);
    assert_eq!(fifo.with_front(|front| *front), Some('a'));
    assert_eq!(fifo.pop_front(), Some('a'));
    assert_eq!(fifo.pop_front(), Some('c'));
    assert!(fifo.is_empty());
    test_complete!("abort_removes_only_its_entry");
}

#[test]
fn aborted_source_hands_item_back() {
    init_test("aborted_source_hands_item_back");
    let fifo = AbortableFifo::new(|_: u8| panic!("nothing was queued"));
    let source = AbortSource::new();
    source.request_abort();
    assert_eq!(fifo.push_back_abortable(7, &source), Err(7));
    assert!(fifo.is_empty());
}

#[test]
fn deadline_without_reactor_is_refused() {
    init_test("deadline_without_reactor_is_refused");
    let fifo = ExpiringFifo::new(|_: (), _| {});
    assert!(fifo.push_back_until((), Time::from_millis(1)).is_err());
    assert!(fifo.is_empty());
    // No timer is needed for entries that never expire.
    assert!(fifo.push_back_until((), Time::MAX).is_ok());
}
