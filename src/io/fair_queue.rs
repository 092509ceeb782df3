//! Fair sharing of a device between priority classes.
//!
//! Each class keeps an accumulator of the capacity it consumed, scaled by
//! `FAIR_SCALE / shares`. Dispatch always serves the head request of the
//! pending class with the smallest accumulator (ties go to the lower class
//! id), so under saturation every pending class gets capacity in
//! proportion to its shares. A class that sat idle re-enters at the
//! smallest accumulator still in play, minus at most `bank_limit` cost
//! units worth of catch-up credit.
//!
//! Device capacity lives in a [`FairGroup`] shared by all shards: an
//! optional [`SharedTokenBucket`] for bandwidth and an atomic in-flight
//! counter for concurrency. A request leaves the queue only once both have
//! room for it.

use crate::error::{Error, ErrorKind, Result};
use crate::io::token_bucket::SharedTokenBucket;
use crate::types::{ClassId, RequestId, Time};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Accumulator units per cost unit at one share.
pub const FAIR_SCALE: u64 = 1 << 16;

/// Accumulators are rebased once the smallest one passes this value.
const REBASE_AT: u64 = 1 << 62;

/// Device capacity shared by every shard's queue.
pub struct FairGroup {
    name: String,
    bucket: Option<SharedTokenBucket>,
    max_in_flight: usize,
    in_flight: AtomicUsize,
}

impl FairGroup {
    /// Creates a capacity group. A `bucket` of `None` means unlimited
    /// bandwidth; `max_in_flight` of zero means unlimited concurrency.
    #[must_use]
    pub fn new(name: impl Into<String>, bucket: Option<SharedTokenBucket>, max_in_flight: usize) -> Self {
        Self {
            name: name.into(),
            bucket,
            max_in_flight,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Group name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bandwidth bucket, if bandwidth is limited.
    #[must_use]
    pub fn bucket(&self) -> Option<&SharedTokenBucket> {
        self.bucket.as_ref()
    }

    /// Requests dispatched and not finished, across all shards.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Concurrency limit; zero means unlimited.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    fn try_acquire_slot(&self) -> bool {
        if self.max_in_flight == 0 {
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_in_flight).then_some(n + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

impl fmt::Debug for FairGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FairGroup")
            .field("name", &self.name)
            .field("bucket", &self.bucket)
            .field("max_in_flight", &self.max_in_flight)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Counters of one priority class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassStats {
    /// Class name.
    pub name: String,
    /// Current shares.
    pub shares: u32,
    /// Scaled capacity consumed.
    pub accumulated: u64,
    /// Requests waiting.
    pub queued: usize,
    /// Requests dispatched so far.
    pub dispatched: u64,
    /// Cost units dispatched so far.
    pub cost_dispatched: u64,
}

struct Entry<T> {
    id: RequestId,
    cost: u64,
    payload: T,
}

struct PriorityClass<T> {
    name: String,
    shares: u32,
    accumulated: u64,
    queue: VecDeque<Entry<T>>,
    dispatched: u64,
    cost_dispatched: u64,
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    tail: u64,
    tokens: u64,
}

/// Per-shard fair queue over a shared [`FairGroup`].
pub struct FairQueue<T> {
    group: std::sync::Arc<FairGroup>,
    bank_limit: u64,
    classes: Vec<Option<PriorityClass<T>>>,
    floor: u64,
    queued: usize,
    in_flight: usize,
    reservation: Option<Reservation>,
    credit: u64,
}

impl<T> FairQueue<T> {
    /// Creates an empty queue drawing capacity from `group`.
    #[must_use]
    pub fn new(group: std::sync::Arc<FairGroup>, bank_limit: u64) -> Self {
        Self {
            group,
            bank_limit,
            classes: Vec::new(),
            floor: 0,
            queued: 0,
            in_flight: 0,
            reservation: None,
            credit: 0,
        }
    }

    /// The shared capacity group.
    #[must_use]
    pub fn group(&self) -> &std::sync::Arc<FairGroup> {
        &self.group
    }

    fn class(&self, id: ClassId) -> Result<&PriorityClass<T>> {
        self.classes
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| invalid_class(id))
    }

    fn class_mut(&mut self, id: ClassId) -> Result<&mut PriorityClass<T>> {
        self.classes
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| invalid_class(id))
    }

    /// Registers a priority class. Shares must be positive.
    pub fn register_class(&mut self, name: &str, shares: u32) -> Result<ClassId> {
        if shares == 0 {
            return Err(Error::new(ErrorKind::InvalidClass)
                .with_message(format!("class {name}: shares must be positive")));
        }
        let class = PriorityClass {
            name: name.to_string(),
            shares,
            accumulated: self.floor,
            queue: VecDeque::new(),
            dispatched: 0,
            cost_dispatched: 0,
        };
        let slot = self.classes.iter().position(Option::is_none);
        let index = match slot {
            Some(index) => {
                self.classes[index] = Some(class);
                index
            }
            None => {
                self.classes.push(Some(class));
                self.classes.len() - 1
            }
        };
        let id = ClassId(u32::try_from(index).map_err(|_| Error::internal("too many classes"))?);
        tracing::debug!(group = %self.group.name(), class = %id, name, shares, "priority class registered");
        Ok(id)
    }

    /// Removes a class. Fails while requests are queued on it.
    pub fn unregister_class(&mut self, id: ClassId) -> Result<()> {
        let queued = self.class(id)?.queue.len();
        if queued > 0 {
            return Err(Error::new(ErrorKind::InvalidClass)
                .with_message(format!("class {id} still has {queued} queued requests")));
        }
        self.classes[id.index()] = None;
        Ok(())
    }

    /// Changes the shares of a class.
    pub fn set_shares(&mut self, id: ClassId, shares: u32) -> Result<()> {
        if shares == 0 {
            return Err(Error::new(ErrorKind::InvalidClass)
                .with_message(format!("class {id}: shares must be positive")));
        }
        self.class_mut(id)?.shares = shares;
        Ok(())
    }

    /// Looks a class up by name.
    #[must_use]
    pub fn find_class(&self, name: &str) -> Option<ClassId> {
        self.classes.iter().enumerate().find_map(|(i, c)| {
            c.as_ref()
                .filter(|c| c.name == name)
                .and_then(|_| u32::try_from(i).ok().map(ClassId))
        })
    }

    /// Queues a request of `cost` units on class `id`.
    pub fn queue(&mut self, id: ClassId, request: RequestId, cost: u64, payload: T) -> Result<()> {
        let floor = self.floor;
        let bank_limit = self.bank_limit;
        let class = self.class_mut(id)?;
        if class.queue.is_empty() {
            let credit = bank_limit.saturating_mul(FAIR_SCALE) / u64::from(class.shares);
            class.accumulated = class.accumulated.max(floor.saturating_sub(credit));
        }
        class.queue.push_back(Entry {
            id: request,
            cost: cost.max(1),
            payload,
        });
        self.queued += 1;
        Ok(())
    }

    /// Takes a queued request back out. Returns `None` if it already left
    /// the queue.
    pub fn remove(&mut self, id: ClassId, request: RequestId) -> Option<T> {
        let class = self.class_mut(id).ok()?;
        let pos = class.queue.iter().position(|e| e.id == request)?;
        let entry = class.queue.remove(pos)?;
        self.queued -= 1;
        Some(entry.payload)
    }

    /// Requests waiting across all classes.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued
    }

    /// Requests this queue dispatched that have not finished.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Counters of one class.
    pub fn class_stats(&self, id: ClassId) -> Result<ClassStats> {
        let class = self.class(id)?;
        Ok(ClassStats {
            name: class.name.clone(),
            shares: class.shares,
            accumulated: class.accumulated,
            queued: class.queue.len(),
            dispatched: class.dispatched,
            cost_dispatched: class.cost_dispatched,
        })
    }

    fn pick(&self) -> Option<usize> {
        self.classes
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().filter(|c| !c.queue.is_empty()).map(|c| (c.accumulated, i)))
            .min()
            .map(|(_, i)| i)
    }

    /// True once enough tokens for `cost` are owned.
    fn reserve(&mut self, bucket: &SharedTokenBucket, now: Time, cost: u64) -> bool {
        let wanted = cost.min(bucket.limit());
        bucket.replenish(now);
        if let Some(reservation) = self.reservation {
            if bucket.deficiency(reservation.tail) > 0 {
                return false;
            }
            self.reservation = None;
            self.credit += reservation.tokens;
        }
        if self.credit >= wanted {
            return true;
        }
        let missing = wanted - self.credit;
        let tail = bucket.grab(missing);
        if bucket.deficiency(tail) > 0 {
            self.reservation = Some(Reservation {
                tail,
                tokens: missing,
            });
            return false;
        }
        self.credit += missing;
        true
    }

    /// Dispatches as many requests as capacity allows, handing each to
    /// `sink`. Returns the number dispatched.
    pub fn dispatch(&mut self, now: Time, mut sink: impl FnMut(ClassId, RequestId, T)) -> usize {
        let group = std::sync::Arc::clone(&self.group);
        let mut dispatched = 0;
        while let Some(index) = self.pick() {
            let cost = self.classes[index]
                .as_ref()
                .and_then(|c| c.queue.front())
                .map_or(1, |e| e.cost);
            if let Some(bucket) = group.bucket() {
                if !self.reserve(bucket, now, cost) {
                    break;
                }
            }
            if !group.try_acquire_slot() {
                break;
            }
            if let Some(bucket) = group.bucket() {
                self.credit -= cost.min(bucket.limit());
            }
            let Some(class) = self.classes[index].as_mut() else {
                group.release_slot();
                break;
            };
            let Some(entry) = class.queue.pop_front() else {
                group.release_slot();
                break;
            };
            self.floor = class.accumulated;
            class.accumulated = class
                .accumulated
                .saturating_add(entry.cost.saturating_mul(FAIR_SCALE) / u64::from(class.shares));
            class.dispatched += 1;
            class.cost_dispatched += entry.cost;
            self.queued -= 1;
            self.in_flight += 1;
            dispatched += 1;
            let class_id = ClassId(u32::try_from(index).unwrap_or(u32::MAX));
            tracing::trace!(class = %class_id, request = %entry.id, cost = entry.cost, "request dispatched");
            sink(class_id, entry.id, entry.payload);
        }
        self.rebase();
        dispatched
    }

    /// Releases the capacity held by one finished request.
    pub fn notify_finished(&mut self) {
        if self.in_flight == 0 {
            tracing::error!(group = %self.group.name(), "finish notified with nothing in flight");
            return;
        }
        self.in_flight -= 1;
        self.group.release_slot();
    }

    /// When the queue waits for bandwidth, the time the tokens it waits on
    /// should be there.
    #[must_use]
    pub fn next_ready_time(&self) -> Option<Time> {
        if self.queued == 0 {
            return None;
        }
        let bucket = self.group.bucket()?;
        self.reservation.map(|r| bucket.ready_at(r.tail))
    }

    fn rebase(&mut self) {
        if self.floor < REBASE_AT {
            return;
        }
        let base = self.floor;
        for class in self.classes.iter_mut().flatten() {
            class.accumulated = class.accumulated.saturating_sub(base);
        }
        self.floor = 0;
    }
}

impl<T> Drop for FairQueue<T> {
    fn drop(&mut self) {
        for _ in 0..self.in_flight {
            self.group.release_slot();
        }
    }
}

impl<T> fmt::Debug for FairQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FairQueue")
            .field("group", &self.group.name())
            .field("classes", &self.classes.iter().flatten().count())
            .field("queued", &self.queued)
            .field("in_flight", &self.in_flight)
            .field("credit", &self.credit)
            .finish_non_exhaustive()
    }
}

fn invalid_class(id: ClassId) -> Error {
    Error::new(ErrorKind::InvalidClass).with_message(format!("no priority class {id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn unlimited(max_in_flight: usize) -> Arc<FairGroup> {
        Arc::new(FairGroup::new("test", None, max_in_flight))
    }

    #[test]
    fn concurrency_limit_holds_requests() {
        let mut fq = FairQueue::new(unlimited(2), 0);
        let c = fq.register_class("c", 100).expect("class");
        for n in 0..4 {
            fq.queue(c, RequestId::new_for_test(n), 1, n).expect("queue");
        }
        let mut out = Vec::new();
        fq.dispatch(Time::ZERO, |_, _, p| out.push(p));
        assert_eq!(out, vec![0, 1]);
        fq.notify_finished();
        fq.dispatch(Time::ZERO, |_, _, p| out.push(p));
        assert_eq!(out, vec![0, 1, 2]);
        assert_eq!(fq.queued(), 1);
    }

    #[test]
    fn shares_split_dispatch_order() {
        let mut fq = FairQueue::new(unlimited(1), 0);
        let a = fq.register_class("a", 100).expect("a");
        let b = fq.register_class("b", 300).expect("b");
        for n in 0..40 {
            fq.queue(a, RequestId::new_for_test(n), 10, 'a').expect("a");
            fq.queue(b, RequestId::new_for_test(100 + n), 10, 'b').expect("b");
        }
        let mut order = Vec::new();
        for _ in 0..40 {
            fq.dispatch(Time::ZERO, |_, _, p| order.push(p));
            fq.notify_finished();
        }
        let a_count = order.iter().filter(|p| **p == 'a').count();
        assert_eq!(a_count, 10, "order: {order:?}");
    }

    #[test]
    fn idle_class_banks_limited_credit() {
        let mut fq = FairQueue::new(unlimited(1), 5);
        let busy = fq.register_class("busy", 100).expect("busy");
        let idle = fq.register_class("idle", 100).expect("idle");
        for n in 0..100 {
            fq.queue(busy, RequestId::new_for_test(n), 1, 'b').expect("queue");
        }
        for _ in 0..50 {
            fq.dispatch(Time::ZERO, |_, _, _| {});
            fq.notify_finished();
        }
        for n in 0..20 {
            fq.queue(idle, RequestId::new_for_test(1000 + n), 1, 'i').expect("queue");
        }
        let mut order = Vec::new();
        for _ in 0..20 {
            fq.dispatch(Time::ZERO, |_, _, p| order.push(p));
            fq.notify_finished();
        }
        // Five units of banked credit, then strict alternation.
        let leading = order.iter().take_while(|p| **p == 'i').count();
        assert!((5..=7).contains(&leading), "order: {order:?}");
    }

    #[test]
    fn removal_and_unregister() {
        let mut fq = FairQueue::new(unlimited(0), 0);
        let c = fq.register_class("c", 10).expect("class");
        fq.queue(c, RequestId::new_for_test(1), 1, ()).expect("queue");
        assert!(fq.unregister_class(c).is_err());
        assert_eq!(fq.remove(c, RequestId::new_for_test(1)), Some(()));
        assert_eq!(fq.remove(c, RequestId::new_for_test(1)), None);
        fq.unregister_class(c).expect("empty class");
        assert_eq!(
            fq.queue(c, RequestId::new_for_test(2), 1, ()).map_err(|e| e.kind()),
            Err(ErrorKind::InvalidClass)
        );
    }

    #[test]
    fn bandwidth_limit_defers_dispatch() {
        let bucket = SharedTokenBucket::new(100, 50, 1, Time::ZERO);
        let group = Arc::new(FairGroup::new("bw", Some(bucket), 0));
        let mut fq = FairQueue::new(group, 0);
        let c = fq.register_class("c", 100).expect("class");
        for n in 0..10 {
            fq.queue(c, RequestId::new_for_test(n), 10, ()).expect("queue");
        }
        assert_eq!(fq.dispatch(Time::ZERO, |_, _, ()| {}), 5);
        assert_eq!(fq.next_ready_time(), Some(Time::from_millis(100)));
        assert_eq!(fq.dispatch(Time::from_millis(50), |_, _, ()| {}), 0);
        assert_eq!(fq.dispatch(Time::from_millis(100), |_, _, ()| {}), 1);
    }
}
