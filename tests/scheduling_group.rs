//! CPU sharing between scheduling groups.

#![allow(missing_docs)]

#[macro_use]
mod common;

use common::*;
use percore::runtime::{self, Reactor, ReactorConfig};
use percore::{ErrorKind, Future, GroupId, Promise};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

fn init_test(test_name: &str) {
    init_test_logging();
    test_phase!(test_name);
}

fn small_batch_reactor() -> Reactor {
    let config = ReactorConfig {
        max_tasks_per_batch: 8,
        ..ReactorConfig::default()
    };
    Reactor::with_virtual_clock(config)
        .expect("reactor")
        .0
}

struct Spinner {
    ran: Rc<Cell<u64>>,
    total: Rc<Cell<u64>>,
    limit: u64,
    done: Rc<RefCell<Option<Promise<()>>>>,
}

impl Spinner {
    fn start(
        group: GroupId,
        ran: Rc<Cell<u64>>,
        total: Rc<Cell<u64>>,
        limit: u64,
        done: Rc<RefCell<Option<Promise<()>>>>,
    ) {
        let spinner = Self {
            ran,
            total,
            limit,
            done,
        };
        runtime::schedule_in(group, move || spinner.step());
    }

    fn step(self) {
        if self.total.get() >= self.limit {
            if let Some(promise) = self.done.borrow_mut().take() {
                promise.set_value(());
            }
            return;
        }
        self.ran.set(self.ran.get() + 1);
        self.total.set(self.total.get() + 1);
        // Rescheduled in the current group, which is the spinner's group.
        runtime::schedule(move || self.step());
    }
}

fn spin_two_groups(shares: (u32, u32), limit: u64) -> (u64, u64) {
    let reactor = small_batch_reactor();
    let a_ran = Rc::new(Cell::new(0));
    let b_ran = Rc::new(Cell::new(0));
    let (a, b) = (Rc::clone(&a_ran), Rc::clone(&b_ran));
    reactor
        .block_on(move || {
            let ga = runtime::create_scheduling_group("light", shares.0).expect("light");
            let gb = runtime::create_scheduling_group("heavy", shares.1).expect("heavy");
            let total = Rc::new(Cell::new(0));
            let mut promise = Promise::new();
            let fut = promise.future();
            let done = Rc::new(RefCell::new(Some(promise)));
            Spinner::start(ga, a, Rc::clone(&total), limit, Rc::clone(&done));
            Spinner::start(gb, b, total, limit, done);
            fut
        })
        .expect("spinners finished");
    (a_ran.get(), b_ran.get())
}

#[test]
fn cpu_split_follows_shares() {
    init_test("cpu_split_follows_shares");
    let (light, heavy) = spin_two_groups((100, 300), 8000);
    let ratio = heavy as f64 / light.max(1) as f64;
    assert_with_log!(
        (2.5..=3.5).contains(&ratio),
        "heavy/light task ratio",
        3.0,
        ratio
    );
    test_complete!("cpu_split_follows_shares", light = light, heavy = heavy);
}

#[test]
fn equal_shares_split_evenly() {
    init_test("equal_shares_split_evenly");
    let (a, b) = spin_two_groups((500, 500), 4000);
    let diff = a.abs_diff(b);
    assert_with_log!(diff <= 16, "task count difference", "<= 16", diff);
    test_complete!("equal_shares_split_evenly");
}

#[test]
fn group_stats_track_tasks() {
    init_test("group_stats_track_tasks");
    let out = run_virtual(|| {
        let group = runtime::create_scheduling_group("stats", 250).expect("group");
        let done = (0..10)
            .map(|_| runtime::with_scheduling_group(group, || Future::ready(())))
            .collect();
        percore::future::when_all_succeed(done).map(move |_| {
            let stats = runtime::group_stats(group).expect("stats");
            assert_eq!(stats.name, "stats");
            assert_eq!(stats.shares, 250);
            assert!(stats.tasks_run >= 10, "tasks_run = {}", stats.tasks_run);
            assert_eq!(stats.queued, 0);
        })
    });
    assert!(out.is_ok());
}

#[test]
fn unknown_group_is_rejected() {
    init_test("unknown_group_is_rejected");
    let out = run_virtual(|| {
        let group = runtime::create_scheduling_group("short-lived", 100).expect("group");
        runtime::destroy_scheduling_group(group).expect("destroy idle group");
        runtime::with_scheduling_group(group, || Future::ready(()))
    });
    assert_err_kind!(out, ErrorKind::InvalidGroup);
    test_complete!("unknown_group_is_rejected");
}

#[test]
fn set_shares_takes_effect() {
    init_test("set_shares_takes_effect");
    let out = run_virtual(|| {
        let group = runtime::create_scheduling_group("tunable", 100).expect("group");
        runtime::set_shares(group, 700).expect("set shares");
        let stats = runtime::group_stats(group).expect("stats");
        Future::ready((stats.shares, runtime::scheduling_group("tunable") == Some(group)))
    });
    assert_eq!(out.ok(), Some((700, true)));
}
