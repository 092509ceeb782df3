//! The per-shard reactor.
//!
//! A reactor owns everything its shard runs: the scheduling groups and
//! their task queues, the timer heap, the readiness poller, the registered
//! poll sources (I/O queues, the cross-shard inbox) and the stall detector.
//! Nothing in here is shared with other threads except the poller handle
//! used for wakeups.
//!
//! # Loop
//!
//! Each turn of the loop:
//!
//! 1. fires expired timers, polls readiness without blocking and polls
//!    every [`PollSource`];
//! 2. if any group has tasks, picks the group with the smallest virtual
//!    runtime and runs its tasks until the task quota elapses or the queue
//!    empties, then charges the elapsed time to the group;
//! 3. otherwise idles: a virtual clock jumps to the next deadline, a wall
//!    clock blocks in the poller until the next deadline, a readiness event
//!    or a cross-shard notification.
//!
//! A standalone reactor with nothing left that could ever make progress
//! reports [`ErrorKind::Deadlock`](crate::error::ErrorKind::Deadlock) from
//! [`Reactor::block_on`] instead of sleeping forever.

use crate::error::{Error, ErrorKind, Result};
use crate::future::Future;
use crate::io::IoQueue;
use crate::runtime::config::ReactorConfig;
use crate::runtime::local;
use crate::runtime::poller::{PollSource, ReadinessPoller};
use crate::runtime::sched_group::{GroupScheduler, GroupStats};
use crate::runtime::stall::StallDetector;
use crate::runtime::task::{Task, TaskFn};
use crate::runtime::timer::{TimerHeap, TimerId};
use crate::smp::queue::SmpEndpoint;
use crate::time::{ClockSource, VirtualClock};
use crate::types::{GroupId, ShardId, TaskId, Time};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

/// Lifecycle of a reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorState {
    /// Created, not driving work.
    Idle,
    /// Inside `block_on` or `run`.
    Running,
    /// Stop requested: exit hooks run, new cross-shard work is refused.
    ShuttingDown,
    /// Finished; no more work will run.
    Stopped,
}

/// Reactor counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReactorStats {
    /// Tasks executed.
    pub tasks_run: u64,
    /// Group batches executed.
    pub batches: u64,
    /// Batches cut short by the task quota while work remained.
    pub preemptions: u64,
    /// Loop turns.
    pub polls: u64,
    /// Idle periods (blocking waits or virtual time jumps).
    pub sleeps: u64,
    /// Tasks that exceeded the stall threshold.
    pub stalls: u64,
    /// Tasks that panicked.
    pub panics: u64,
    /// Timers fired.
    pub timers_fired: u64,
}

#[derive(Debug, Clone, Copy)]
struct Batch {
    deadline: Time,
}

type ExitHook = Box<dyn FnOnce() -> Future<()>>;

pub(crate) struct Core {
    shard: ShardId,
    shard_count: usize,
    clock: ClockSource,
    config: ReactorConfig,
    state: Cell<ReactorState>,
    in_loop: Cell<bool>,
    sched: RefCell<GroupScheduler>,
    current_group: Cell<GroupId>,
    batch: Cell<Option<Batch>>,
    nested_ns: Cell<u64>,
    timers: RefCell<TimerHeap>,
    stall: RefCell<StallDetector>,
    poller: ReadinessPoller,
    sources: RefCell<Vec<Rc<dyn PollSource>>>,
    exit_hooks: RefCell<Vec<ExitHook>>,
    stats: RefCell<ReactorStats>,
    next_task: Cell<u64>,
    smp: RefCell<Option<Rc<SmpEndpoint>>>,
    io_queues: RefCell<HashMap<String, IoQueue>>,
}

impl Core {
    fn new(
        shard: ShardId,
        shard_count: usize,
        mut config: ReactorConfig,
        clock: ClockSource,
        poller: ReadinessPoller,
    ) -> Result<Self> {
        config.normalize();
        let mut sched =
            GroupScheduler::new(config.default_group_shares, config.max_scheduling_groups);
        for spec in &config.scheduling_groups {
            sched.create(&spec.name, spec.shares)?;
        }
        let stall = StallDetector::new(config.stall.clone(), config.stall_handler.clone());
        Ok(Self {
            shard,
            shard_count,
            clock,
            config,
            state: Cell::new(ReactorState::Idle),
            in_loop: Cell::new(false),
            sched: RefCell::new(sched),
            current_group: Cell::new(GroupId::DEFAULT),
            batch: Cell::new(None),
            nested_ns: Cell::new(0),
            timers: RefCell::new(TimerHeap::new()),
            stall: RefCell::new(stall),
            poller,
            sources: RefCell::new(Vec::new()),
            exit_hooks: RefCell::new(Vec::new()),
            stats: RefCell::new(ReactorStats::default()),
            next_task: Cell::new(0),
            smp: RefCell::new(None),
            io_queues: RefCell::new(HashMap::new()),
        })
    }

    pub(crate) fn shard(&self) -> ShardId {
        self.shard
    }

    pub(crate) fn shard_count(&self) -> usize {
        self.shard_count
    }

    pub(crate) fn now(&self) -> Time {
        self.clock.now()
    }

    pub(crate) fn clock(&self) -> &ClockSource {
        &self.clock
    }

    pub(crate) fn state(&self) -> ReactorState {
        self.state.get()
    }

    /// True while new cross-shard work is accepted.
    pub(crate) fn is_accepting(&self) -> bool {
        matches!(self.state.get(), ReactorState::Idle | ReactorState::Running)
    }

    pub(crate) fn current_group(&self) -> GroupId {
        self.current_group.get()
    }

    pub(crate) fn schedule(&self, group: GroupId, func: TaskFn) {
        let id = TaskId(self.next_task.get());
        self.next_task.set(id.0 + 1);
        self.sched.borrow_mut().push(Task::new(id, group, func));
    }

    pub(crate) fn add_timer(&self, deadline: Time, callback: Box<dyn FnOnce()>) -> TimerId {
        let group = self.current_group.get();
        self.timers.borrow_mut().insert(deadline, group, callback)
    }

    pub(crate) fn cancel_timer(&self, id: TimerId) -> bool {
        self.timers.borrow_mut().cancel(id)
    }

    pub(crate) fn need_preempt(&self) -> bool {
        self.batch
            .get()
            .is_some_and(|b| self.clock.now() >= b.deadline)
    }

    pub(crate) fn create_group(&self, name: &str, shares: u32) -> Result<GroupId> {
        let id = self.sched.borrow_mut().create(name, shares)?;
        tracing::debug!(shard = %self.shard, group = %id, name, shares, "scheduling group created");
        Ok(id)
    }

    pub(crate) fn destroy_group(&self, id: GroupId) -> Result<()> {
        self.sched.borrow_mut().destroy(id)?;
        tracing::debug!(shard = %self.shard, group = %id, "scheduling group destroyed");
        Ok(())
    }

    pub(crate) fn set_shares(&self, id: GroupId, shares: u32) -> Result<()> {
        self.sched.borrow_mut().set_shares(id, shares)
    }

    pub(crate) fn find_group(&self, name: &str) -> Option<GroupId> {
        self.sched.borrow().find(name)
    }

    pub(crate) fn has_group(&self, id: GroupId) -> bool {
        self.sched.borrow().contains(id)
    }

    pub(crate) fn group_stats(&self, id: GroupId) -> Result<GroupStats> {
        self.sched.borrow().stats(id)
    }

    pub(crate) fn stats(&self) -> ReactorStats {
        let mut stats = self.stats.borrow().clone();
        stats.stalls = self.stall.borrow().stalls();
        stats
    }

    /// Runs `func` with `group` current, charging its CPU time to `group`.
    pub(crate) fn run_in_group<R>(&self, group: GroupId, func: impl FnOnce() -> R) -> Result<R> {
        if !self.has_group(group) {
            return Err(Error::new(ErrorKind::InvalidGroup)
                .with_message(format!("no scheduling group {group}")));
        }
        struct Restore<'a> {
            core: &'a Core,
            prev_group: GroupId,
            saved_nested: u64,
            group: GroupId,
            started: Time,
        }
        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                let elapsed = self.core.clock.now().duration_since(self.started);
                let inner = self.core.nested_ns.get();
                self.core
                    .sched
                    .borrow_mut()
                    .charge(self.group, elapsed.saturating_sub(inner), 0);
                self.core.nested_ns.set(self.saved_nested + elapsed);
                self.core.current_group.set(self.prev_group);
            }
        }
        let _restore = Restore {
            core: self,
            prev_group: self.current_group.replace(group),
            saved_nested: self.nested_ns.replace(0),
            group,
            started: self.clock.now(),
        };
        Ok(func())
    }

    pub(crate) fn add_source(&self, source: Rc<dyn PollSource>) {
        tracing::debug!(shard = %self.shard, source = source.name(), "poll source registered");
        self.sources.borrow_mut().push(source);
    }

    pub(crate) fn attach_smp(&self, endpoint: Rc<SmpEndpoint>) {
        self.add_source(endpoint.clone());
        *self.smp.borrow_mut() = Some(endpoint);
    }

    pub(crate) fn smp(&self) -> Option<Rc<SmpEndpoint>> {
        self.smp.borrow().clone()
    }

    pub(crate) fn add_io_queue(&self, name: &str, queue: IoQueue) {
        self.add_source(Rc::new(queue.clone()));
        self.io_queues.borrow_mut().insert(name.to_string(), queue);
    }

    pub(crate) fn io_queue(&self, name: &str) -> Option<IoQueue> {
        self.io_queues.borrow().get(name).cloned()
    }

    pub(crate) fn poller(&self) -> &ReadinessPoller {
        &self.poller
    }

    pub(crate) fn at_exit(&self, hook: ExitHook) {
        self.exit_hooks.borrow_mut().push(hook);
    }

    pub(crate) fn request_stop(&self) {
        if matches!(self.state.get(), ReactorState::Idle | ReactorState::Running) {
            tracing::info!(shard = %self.shard, "reactor stop requested");
            self.state.set(ReactorState::ShuttingDown);
        }
    }

    fn run_task(&self, task: Task) {
        let id = task.id;
        let group = task.group;
        self.current_group.set(group);
        let started = self.clock.now();
        let outcome = task.run();
        let finished = self.clock.now();
        self.current_group.set(GroupId::DEFAULT);
        {
            let mut stats = self.stats.borrow_mut();
            stats.tasks_run += 1;
            if outcome.is_err() {
                stats.panics += 1;
            }
        }
        if let Err(message) = outcome {
            tracing::error!(shard = %self.shard, task = %id, group = %group, panic = %message, "task panicked");
        }
        let report = self
            .stall
            .borrow_mut()
            .check(self.shard, id, group, started, finished);
        if let Some((report, Some(handler))) = report {
            handler(&report);
        }
    }

    /// Runs one batch of the most deserving group. Returns false if nothing
    /// was runnable.
    fn run_batch(&self) -> bool {
        let Some(group) = self.sched.borrow_mut().pick_next() else {
            return false;
        };
        let started = self.clock.now();
        self.batch.set(Some(Batch {
            deadline: started + self.config.task_quota,
        }));
        self.nested_ns.set(0);
        let mut ran: u64 = 0;
        let mut preempted = false;
        loop {
            let task = self.sched.borrow_mut().pop(group);
            let Some(task) = task else {
                break;
            };
            self.run_task(task);
            ran += 1;
            let out_of_quota = self.need_preempt()
                || ran >= self.config.max_tasks_per_batch as u64;
            if out_of_quota {
                preempted = self.sched.borrow().queued_in(group) > 0;
                break;
            }
        }
        self.batch.set(None);
        let elapsed = self
            .clock
            .now()
            .duration_since(started)
            .saturating_sub(self.nested_ns.replace(0));
        // Every task costs at least a nanosecond so a clock that does not
        // move while tasks run still rotates groups by shares.
        self.sched
            .borrow_mut()
            .charge(group, elapsed.max(ran), ran);
        let mut stats = self.stats.borrow_mut();
        stats.batches += 1;
        if preempted {
            stats.preemptions += 1;
        }
        true
    }

    fn fire_timers(&self) -> bool {
        let now = self.clock.now();
        let expired = self.timers.borrow_mut().pop_expired(now);
        if expired.is_empty() {
            return false;
        }
        self.stats.borrow_mut().timers_fired += expired.len() as u64;
        for timer in expired {
            self.schedule(timer.group, timer.callback);
        }
        true
    }

    fn dispatch_readiness(&self, fired: Vec<crate::runtime::poller::Fired>) -> bool {
        let any = !fired.is_empty();
        for event in fired {
            let token = event.token;
            let callback = event.callback;
            let readiness = event.readiness;
            self.schedule(
                event.group,
                Box::new(move || {
                    (callback.borrow_mut())(readiness);
                    if let Some(core) = local::current() {
                        core.poller.rearm(token);
                    }
                }),
            );
        }
        any
    }

    fn poll_sources(&self) -> Result<bool> {
        let mut progressed = self.fire_timers();
        if self.poller.has_registrations() {
            let fired = self.poller.wait(Some(std::time::Duration::ZERO))?;
            progressed |= self.dispatch_readiness(fired);
        }
        let count = self.sources.borrow().len();
        let now = self.clock.now();
        for i in 0..count {
            let source = self.sources.borrow().get(i).cloned();
            if let Some(source) = source {
                progressed |= source.poll(now);
            }
        }
        Ok(progressed)
    }

    fn next_deadline(&self) -> Option<Time> {
        let timer = self.timers.borrow_mut().peek_deadline();
        let source = self
            .sources
            .borrow()
            .iter()
            .filter_map(|s| s.next_deadline())
            .min();
        match (timer, source) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn sources_pending(&self) -> bool {
        self.sources.borrow().iter().any(|s| s.has_pending())
    }

    fn idle(&self) -> Result<()> {
        let now = self.clock.now();
        let next = self.next_deadline();
        let smp = self.smp();
        if self.clock.is_virtual() {
            if let Some(deadline) = next {
                self.clock.advance_to(deadline.max(now));
                self.stats.borrow_mut().sleeps += 1;
                return Ok(());
            }
        }
        let can_wake = next.is_some()
            || smp.is_some()
            || self.poller.has_registrations()
            || self.sources_pending();
        if !can_wake {
            return Err(Error::new(ErrorKind::Deadlock)
                .with_message("no runnable tasks, timers, or pending sources remain"));
        }
        let mut timeout = self.config.idle_poll_timeout;
        if let Some(deadline) = next {
            timeout = timeout.min(deadline - now);
        }
        if let Some(endpoint) = &smp {
            if !endpoint.prepare_sleep() {
                return Ok(());
            }
        }
        self.stats.borrow_mut().sleeps += 1;
        let fired = self.poller.wait(Some(timeout));
        if let Some(endpoint) = &smp {
            endpoint.finish_sleep();
        }
        self.dispatch_readiness(fired?);
        Ok(())
    }

    /// One loop turn.
    fn turn(&self) -> Result<()> {
        self.stats.borrow_mut().polls += 1;
        let progressed = self.poll_sources()?;
        if self.run_batch() || progressed {
            return Ok(());
        }
        self.idle()
    }

    fn has_runnable(&self) -> bool {
        self.sched.borrow().has_runnable()
    }

    fn take_exit_hooks(&self) -> Vec<ExitHook> {
        let mut hooks = std::mem::take(&mut *self.exit_hooks.borrow_mut());
        hooks.reverse();
        hooks
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        let leftover = self.sched.get_mut().drain();
        if !leftover.is_empty() {
            tracing::debug!(
                shard = %self.shard,
                tasks = leftover.len(),
                "reactor dropped with queued tasks"
            );
        }
    }
}

/// A single-shard event loop.
///
/// # Example
///
/// ```ignore
/// use percore::runtime::{Reactor, ReactorConfig};
/// use percore::Future;
///
/// let reactor = Reactor::new(ReactorConfig::default())?;
/// let answer = reactor.block_on(|| Future::ready(40).map(|v| v + 2))?;
/// assert_eq!(answer, 42);
/// ```
pub struct Reactor {
    core: Rc<Core>,
}

impl Reactor {
    /// Creates a standalone reactor on the wall clock.
    pub fn new(config: ReactorConfig) -> Result<Self> {
        Self::with_clock(config, ClockSource::wall())
    }

    /// Creates a standalone reactor on `clock`.
    pub fn with_clock(config: ReactorConfig, clock: ClockSource) -> Result<Self> {
        Self::for_shard(ShardId::new(0), 1, config, clock, ReadinessPoller::new()?)
    }

    /// Creates a standalone reactor on a fresh virtual clock.
    ///
    /// When idle, the reactor jumps the clock to its next deadline.
    pub fn with_virtual_clock(config: ReactorConfig) -> Result<(Self, Arc<VirtualClock>)> {
        let clock = Arc::new(VirtualClock::new());
        let reactor = Self::with_clock(config, ClockSource::from_virtual(clock.clone()))?;
        Ok((reactor, clock))
    }

    pub(crate) fn for_shard(
        shard: ShardId,
        shard_count: usize,
        config: ReactorConfig,
        clock: ClockSource,
        poller: ReadinessPoller,
    ) -> Result<Self> {
        let core = Core::new(shard, shard_count, config, clock, poller)?;
        Ok(Self {
            core: Rc::new(core),
        })
    }

    pub(crate) fn core(&self) -> &Rc<Core> {
        &self.core
    }

    /// The shard this reactor drives.
    #[must_use]
    pub fn shard_id(&self) -> ShardId {
        self.core.shard
    }

    /// The reactor clock.
    #[must_use]
    pub fn clock(&self) -> &ClockSource {
        &self.core.clock
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> ReactorState {
        self.core.state.get()
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> ReactorStats {
        self.core.stats()
    }

    /// Counters of one scheduling group.
    pub fn group_stats(&self, group: GroupId) -> Result<GroupStats> {
        self.core.group_stats(group)
    }

    fn begin(&self) -> Result<LoopGuard<'_>> {
        if self.core.in_loop.get() {
            return Err(Error::invalid_state("reactor is already running"));
        }
        if self.core.state.get() == ReactorState::Stopped {
            return Err(Error::invalid_state("reactor has stopped"));
        }
        self.core.in_loop.set(true);
        if self.core.state.get() == ReactorState::Idle {
            self.core.state.set(ReactorState::Running);
        }
        Ok(LoopGuard {
            core: &self.core,
            _enter: local::enter(Rc::clone(&self.core)),
        })
    }

    /// Runs the loop until the future built by `make` resolves.
    ///
    /// `make` runs inside the reactor, so it may schedule work, arm timers
    /// and create scheduling groups.
    pub fn block_on<T: 'static>(&self, make: impl FnOnce() -> Future<T>) -> Result<T> {
        let _guard = self.begin()?;
        let slot: Rc<RefCell<Option<Result<T>>>> = Rc::new(RefCell::new(None));
        let fut = crate::future::guarded(make).unwrap_or_else(Future::failed);
        let sink = Rc::clone(&slot);
        fut.set_continuation(move |outcome| *sink.borrow_mut() = Some(outcome));
        loop {
            if let Some(outcome) = slot.borrow_mut().take() {
                return outcome;
            }
            self.core.turn()?;
        }
    }

    /// Runs the loop until a stop is requested, then runs the exit hooks in
    /// reverse registration order and drains remaining tasks and every poll
    /// source with pending work, such as I/O still queued or in flight.
    ///
    /// A standalone reactor that runs out of work stops on its own.
    pub fn run(&self) -> Result<()> {
        let _guard = self.begin()?;
        let exit_done = Rc::new(Cell::new(false));
        let mut exit_started = false;
        loop {
            if self.core.state.get() == ReactorState::ShuttingDown && !exit_started {
                exit_started = true;
                let hooks = self.core.take_exit_hooks();
                let done = Rc::clone(&exit_done);
                crate::future::do_for_each(hooks, |hook| {
                    crate::future::guarded(hook).unwrap_or_else(Future::failed)
                })
                .set_continuation(move |outcome| {
                    if let Err(err) = outcome {
                        tracing::warn!(error = %err, "exit hook failed");
                    }
                    done.set(true);
                });
            }
            // In-flight I/O and parked cross-shard messages keep the loop
            // turning after the exit hooks finish.
            if exit_done.get() && !self.core.has_runnable() && !self.core.sources_pending() {
                break;
            }
            match self.core.turn() {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::Deadlock && !exit_started => {
                    self.core.request_stop();
                }
                Err(err) => return Err(err),
            }
        }
        if let Some(endpoint) = self.core.smp() {
            endpoint.mark_stopped();
        }
        self.core.state.set(ReactorState::Stopped);
        tracing::info!(shard = %self.core.shard, "reactor stopped");
        Ok(())
    }

    /// Requests a stop and runs the loop until shutdown completes.
    pub fn shutdown(&self) -> Result<()> {
        self.core.request_stop();
        self.run()
    }
}

struct LoopGuard<'a> {
    core: &'a Core,
    _enter: local::EnterGuard,
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.core.in_loop.set(false);
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("shard", &self.core.shard)
            .field("state", &self.core.state.get())
            .field("queued", &self.core.sched.borrow().queued())
            .field("timers", &self.core.timers.borrow().len())
            .finish()
    }
}
