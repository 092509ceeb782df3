//! Scheduler benchmark suite for percore.
//!
//! Benchmarks the per-shard task path:
//! - Continuations: ready-future chains through the task queue
//! - Scheduling groups: task dispatch across weighted groups
//! - Execution stages: batched calls against one-task-per-call
//! - Cross-shard calls: round trips through the SMP queues
//!
//! Performance targets:
//! - One continuation hop: < 150ns
//! - Cross-shard round trip: < 20µs with idle shards

#![allow(missing_docs)]
#![allow(clippy::semicolon_if_nothing_returned)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use percore::future::{do_for_each, when_all_succeed};
use percore::runtime::{self, Reactor, ReactorConfig, RuntimeBuilder};
use percore::smp::submit_to;
use percore::{ExecutionStage, Future, ShardId};
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

fn reactor() -> Reactor {
    Reactor::new(ReactorConfig::default()).expect("reactor")
}

/// A chain of `len` map continuations on a ready future.
fn chain(len: u64) -> Future<u64> {
    let mut fut = Future::ready(0_u64);
    for _ in 0..len {
        fut = fut.map(|v| v + 1);
    }
    fut
}

// =============================================================================
// CONTINUATION BENCHMARKS
// =============================================================================

fn bench_continuations(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler/continuations");
    let reactor = reactor();

    for &len in &[1_u64, 100, 1000] {
        group.throughput(Throughput::Elements(len));
        group.bench_with_input(BenchmarkId::new("map_chain", len), &len, |b, &len| {
            b.iter(|| black_box(reactor.block_on(|| chain(len)).expect("chain")))
        });
    }

    group.bench_function("do_for_each_1000", |b| {
        b.iter(|| {
            let sum = Rc::new(Cell::new(0_u64));
            let acc = Rc::clone(&sum);
            reactor
                .block_on(move || {
                    do_for_each(0..1000_u64, move |i| {
                        acc.set(acc.get() + i);
                        Future::ready(())
                    })
                })
                .expect("loop");
            black_box(sum.get())
        })
    });

    group.finish();
}

// =============================================================================
// SCHEDULING GROUP BENCHMARKS
// =============================================================================

fn bench_groups(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler/groups");

    for &groups in &[1_usize, 4, 16] {
        group.throughput(Throughput::Elements(1000));
        group.bench_with_input(
            BenchmarkId::new("tasks_across_groups", groups),
            &groups,
            |b, &groups| {
                let reactor = reactor();
                let ids = reactor
                    .block_on(move || {
                        let ids = (0..groups)
                            .map(|g| {
                                runtime::create_scheduling_group(&format!("bench-{g}"), 100)
                                    .expect("group")
                            })
                            .collect::<Vec<_>>();
                        Future::ready(ids)
                    })
                    .expect("groups");
                b.iter(|| {
                    let ids = ids.clone();
                    reactor
                        .block_on(move || {
                            let tasks = (0..1000)
                                .map(|n| {
                                    runtime::with_scheduling_group(ids[n % ids.len()], || {
                                        Future::ready(())
                                    })
                                })
                                .collect();
                            when_all_succeed(tasks)
                        })
                        .expect("tasks")
                })
            },
        );
    }

    group.finish();
}

// =============================================================================
// EXECUTION STAGE BENCHMARKS
// =============================================================================

fn bench_execution_stage(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler/execution_stage");
    let reactor = reactor();
    group.throughput(Throughput::Elements(1000));

    group.bench_function("stage_calls_1000", |b| {
        b.iter(|| {
            reactor
                .block_on(|| {
                    let stage = ExecutionStage::in_current_group("bench", |x: u64| {
                        Future::ready(black_box(x) * 2)
                    });
                    let calls = (0..1000).map(|x| stage.call(x)).collect();
                    when_all_succeed(calls)
                })
                .expect("stage")
        })
    });

    group.bench_function("task_per_call_1000", |b| {
        b.iter(|| {
            reactor
                .block_on(|| {
                    let group = runtime::current_group();
                    let calls = (0..1000_u64)
                        .map(|x| {
                            runtime::with_scheduling_group(group, move || {
                                Future::ready(black_box(x) * 2)
                            })
                        })
                        .collect();
                    when_all_succeed(calls)
                })
                .expect("tasks")
        })
    });

    group.finish();
}

// =============================================================================
// CROSS-SHARD BENCHMARKS
// =============================================================================

fn bench_cross_shard(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler/cross_shard");
    group.sample_size(20);
    let runtime = RuntimeBuilder::new()
        .shards(2)
        .idle_poll_timeout(Duration::from_millis(1))
        .build()
        .expect("runtime");

    for &calls in &[1_u64, 100] {
        group.throughput(Throughput::Elements(calls));
        group.bench_with_input(BenchmarkId::new("round_trips", calls), &calls, |b, &calls| {
            b.iter(|| {
                runtime
                    .block_on(move || {
                        let replies = (0..calls)
                            .map(|n| submit_to(ShardId::new(1), move || Future::ready(n)))
                            .collect();
                        when_all_succeed(replies)
                    })
                    .expect("round trips")
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_continuations,
    bench_groups,
    bench_execution_stage,
    bench_cross_shard,
);

criterion_main!(benches);
