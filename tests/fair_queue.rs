//! Fair queue capacity sharing between priority classes.

#![allow(missing_docs)]

#[macro_use]
mod common;

use common::*;
use percore::io::{FairGroup, FairQueue, SharedTokenBucket};
use percore::{ClassId, RequestId, Time};
use proptest::prelude::*;
use std::sync::Arc;

fn init_test(test_name: &str) {
    init_test_logging();
    test_phase!(test_name);
}

/// Keeps `depth` requests queued on `class`, numbering them from `next`.
fn top_up(fq: &mut FairQueue<ClassId>, class: ClassId, depth: usize, next: &mut u64, cost: u64) {
    let queued = fq.class_stats(class).expect("class").queued;
    for _ in queued..depth {
        fq.queue(class, RequestId::new_for_test(*next), cost, class)
            .expect("queue");
        *next += 1;
    }
}

#[test]
fn shares_split_capped_device() {
    init_test("shares_split_capped_device");
    // 1000 cost units per one-second interval.
    let bucket = SharedTokenBucket::new(1000, 1000, 1, Time::ZERO);
    let group = Arc::new(FairGroup::new("capped", Some(bucket), 0));
    let mut fq = FairQueue::new(group, 0);
    let a = fq.register_class("a", 100).expect("a");
    let b = fq.register_class("b", 900).expect("b");

    let mut next = 0;
    let mut a_total = 0_u64;
    let mut b_total = 0_u64;
    for interval in 0..100_u64 {
        top_up(&mut fq, a, 200, &mut next, 10);
        top_up(&mut fq, b, 200, &mut next, 10);
        let mut a_now = 0;
        let mut b_now = 0;
        let dispatched = fq.dispatch(Time::from_secs(interval), |class, _, _| {
            if class == a {
                a_now += 1;
            } else {
                b_now += 1;
            }
        });
        for _ in 0..dispatched {
            fq.notify_finished();
        }
        assert_with_log!(
            (98..=101).contains(&dispatched),
            "requests per interval",
            100,
            dispatched
        );
        assert_with_log!((8..=12).contains(&a_now), "class a per interval", 10, a_now);
        assert_with_log!((88..=92).contains(&b_now), "class b per interval", 90, b_now);
        a_total += a_now;
        b_total += b_now;
    }
    assert_with_log!(a_total.abs_diff(1000) <= 20, "class a total", 1000, a_total);
    assert_with_log!(b_total.abs_diff(9000) <= 50, "class b total", 9000, b_total);
    test_complete!("shares_split_capped_device", a = a_total, b = b_total);
}

#[test]
fn shared_group_caps_two_shards() {
    init_test("shared_group_caps_two_shards");
    let group = Arc::new(FairGroup::new("shared", None, 3));
    let mut left = FairQueue::new(Arc::clone(&group), 0);
    let mut right = FairQueue::new(Arc::clone(&group), 0);
    let lc = left.register_class("c", 100).expect("left");
    let rc = right.register_class("c", 100).expect("right");
    for n in 0..5 {
        left.queue(lc, RequestId::new_for_test(n), 1, ()).expect("left");
        right.queue(rc, RequestId::new_for_test(n), 1, ()).expect("right");
    }
    let first = left.dispatch(Time::ZERO, |_, _, ()| {});
    let second = right.dispatch(Time::ZERO, |_, _, ()| {});
    assert_eq!(first + second, 3);
    assert_eq!(group.in_flight(), 3);
    left.notify_finished();
    assert_eq!(right.dispatch(Time::ZERO, |_, _, ()| {}), 1);
    test_complete!("shared_group_caps_two_shards");
}

#[test]
fn zero_shares_rejected() {
    init_test("zero_shares_rejected");
    let mut fq: FairQueue<()> = FairQueue::new(Arc::new(FairGroup::new("g", None, 0)), 0);
    assert_err_kind!(fq.register_class("none", 0), percore::ErrorKind::InvalidClass);
    let c = fq.register_class("some", 10).expect("class");
    assert_err_kind!(fq.set_shares(c, 0), percore::ErrorKind::InvalidClass);
    assert_eq!(fq.find_class("some"), Some(c));
}

proptest! {
    #![proptest_config(test_proptest_config(64))]

    #[test]
    fn unlimited_device_drains_in_class_order(
        shares in prop::collection::vec(1_u32..1000, 1..5),
        costs in prop::collection::vec(1_u64..50, 1..60),
    ) {
        init_test_logging();
        let mut fq = FairQueue::new(Arc::new(FairGroup::new("free", None, 0)), 0);
        let classes: Vec<ClassId> = shares
            .iter()
            .enumerate()
            .map(|(i, s)| fq.register_class(&format!("c{i}"), *s).expect("class"))
            .collect();
        for (n, cost) in costs.iter().enumerate() {
            let class = classes[n % classes.len()];
            fq.queue(class, RequestId::new_for_test(n as u64), *cost, (class, n))
                .expect("queue");
        }
        let mut seen = Vec::new();
        let dispatched = fq.dispatch(Time::ZERO, |class, _, payload| seen.push((class, payload)));
        prop_assert_eq!(dispatched, costs.len());
        prop_assert_eq!(fq.queued(), 0);
        prop_assert_eq!(fq.in_flight(), costs.len());
        // Each class is served first in, first out.
        for class in &classes {
            let order: Vec<usize> = seen
                .iter()
                .filter(|(c, _)| c == class)
                .map(|(_, (_, n))| *n)
                .collect();
            prop_assert!(order.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
