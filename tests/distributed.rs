//! A key-value store partitioned across shards.

#![allow(missing_docs)]

#[macro_use]
mod common;

use common::*;
use percore::future::when_all_succeed;
use percore::smp;
use percore::{Distributed, Future, Gate, Service, ShardId};
use std::cell::RefCell;
use std::collections::HashMap;

fn init_test(test_name: &str) {
    init_test_logging();
    test_phase!(test_name);
}

#[derive(Default)]
struct Partition {
    entries: RefCell<HashMap<String, u64>>,
    gate: Gate,
}

impl Service for Partition {
    fn stop(&self) -> Future<()> {
        self.gate.close()
    }
}

fn owner(key: &str) -> ShardId {
    let hash = key.bytes().fold(0_usize, |h, b| h.wrapping_mul(31).wrapping_add(usize::from(b)));
    ShardId::new(u32::try_from(hash % smp::shard_count()).unwrap_or(0))
}

fn put(store: Distributed<Partition>, key: String, value: u64) -> Future<()> {
    store.invoke_on(owner(&key), move |part| {
        let gate = part.gate.clone();
        percore::sync::with_gate(&gate, move || {
            part.entries.borrow_mut().insert(key, value);
            Future::ready(())
        })
    })
}

fn get(store: Distributed<Partition>, key: String) -> Future<Option<u64>> {
    store.invoke_on(owner(&key), move |part| {
        Future::ready(part.entries.borrow().get(&key).copied())
    })
}

#[test]
fn keys_land_on_their_owner() {
    init_test("keys_land_on_their_owner");
    let runtime = test_runtime(3);
    let (values, sizes) = runtime
        .block_on(|| {
            Distributed::<Partition>::start(|_| Partition::default()).then(|store| {
                let puts = (0..30_u64)
                    .map(|n| put(store, format!("key-{n}"), n * 10))
                    .collect();
                when_all_succeed(puts).then(move |_| {
                    let gets = (0..30_u64).map(|n| get(store, format!("key-{n}"))).collect();
                    when_all_succeed(gets).then(move |values| {
                        store
                            .map_reduce(
                                |part| Future::ready(vec![part.entries.borrow().len()]),
                                Vec::new(),
                                |mut acc: Vec<usize>, sizes| {
                                    acc.extend(sizes);
                                    acc
                                },
                            )
                            .then(move |sizes| store.stop().map(move |()| (values, sizes)))
                    })
                })
            })
        })
        .expect("runtime finished");
    let expected: Vec<Option<u64>> = (0..30).map(|n| Some(n * 10)).collect();
    assert_eq!(values, expected);
    assert_eq!(sizes.len(), 3);
    assert_eq!(sizes.iter().sum::<usize>(), 30);
    test_complete!("keys_land_on_their_owner");
}

#[test]
fn missing_key_reads_none() {
    init_test("missing_key_reads_none");
    let runtime = test_runtime(2);
    let out = runtime
        .block_on(|| {
            Distributed::<Partition>::start(|_| Partition::default())
                .then(|store| get(store, "absent".to_string()))
        })
        .expect("runtime finished");
    assert_eq!(out, None);
}
