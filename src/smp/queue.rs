//! Cross-shard message queues.
//!
//! Every ordered pair of shards `(src, dst)` has its own bounded
//! single-producer single-consumer queue, so messages between two shards
//! keep their order and no two threads ever contend on one queue end. When
//! a queue is full the sender parks the message in a local overflow buffer
//! and retries on every reactor turn; while that buffer is non-empty new
//! messages queue behind it to preserve order.
//!
//! After queueing, the sender wakes the destination through its poller if
//! the destination announced that it is about to sleep.

use crate::future::Promise;
use crate::runtime::local;
use crate::runtime::poller::PollSource;
use crate::types::{ShardId, Time};
use crossbeam_queue::ArrayQueue;
use polling::Poller;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;

/// Whether the destination took the work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageKind {
    /// New work; refused once the destination shuts down.
    Request,
    /// Completion of earlier work; always delivered.
    Reply,
}

pub(crate) struct SmpMessage {
    kind: MessageKind,
    run: Box<dyn FnOnce(Admission) + Send>,
}

impl SmpMessage {
    pub(crate) fn request(run: impl FnOnce(Admission) + Send + 'static) -> Self {
        Self {
            kind: MessageKind::Request,
            run: Box::new(run),
        }
    }

    pub(crate) fn reply(run: impl FnOnce(Admission) + Send + 'static) -> Self {
        Self {
            kind: MessageKind::Reply,
            run: Box::new(run),
        }
    }
}

impl fmt::Debug for SmpMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmpMessage")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

pub(crate) fn shard_at(index: usize) -> ShardId {
    ShardId::new(u32::try_from(index).unwrap_or(u32::MAX))
}

/// State shared by every shard of a runtime.
pub(crate) struct SmpShared {
    shards: usize,
    queues: Vec<ArrayQueue<SmpMessage>>,
    wakers: Vec<Arc<Poller>>,
    sleeping: Vec<AtomicBool>,
    stopped: Vec<AtomicBool>,
    stop_requested: AtomicBool,
}

impl SmpShared {
    pub(crate) fn new(capacity: usize, wakers: Vec<Arc<Poller>>) -> Self {
        let shards = wakers.len();
        Self {
            shards,
            queues: (0..shards * shards)
                .map(|_| ArrayQueue::new(capacity.max(1)))
                .collect(),
            wakers,
            sleeping: (0..shards).map(|_| AtomicBool::new(false)).collect(),
            stopped: (0..shards).map(|_| AtomicBool::new(false)).collect(),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub(crate) fn shards(&self) -> usize {
        self.shards
    }

    pub(crate) fn waker(&self, shard: usize) -> Arc<Poller> {
        Arc::clone(&self.wakers[shard])
    }

    fn queue(&self, src: ShardId, dst: ShardId) -> &ArrayQueue<SmpMessage> {
        &self.queues[src.index() * self.shards + dst.index()]
    }

    fn wake(&self, dst: ShardId) {
        if self.sleeping[dst.index()].load(Ordering::SeqCst) {
            if let Err(err) = self.wakers[dst.index()].notify() {
                tracing::warn!(shard = %dst, error = %err, "failed to wake shard");
            }
        }
    }

    /// Asks every shard to shut down.
    pub(crate) fn request_stop_all(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        for waker in &self.wakers {
            let _ = waker.notify();
        }
    }

    pub(crate) fn is_stopped(&self, shard: ShardId) -> bool {
        self.stopped[shard.index()].load(Ordering::SeqCst)
    }
}

impl fmt::Debug for SmpShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmpShared")
            .field("shards", &self.shards)
            .field("stop_requested", &self.stop_requested.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// One shard's end of the cross-shard fabric.
pub(crate) struct SmpEndpoint {
    shard: ShardId,
    shared: Arc<SmpShared>,
    overflow: RefCell<Vec<VecDeque<SmpMessage>>>,
    replies: RefCell<HashMap<u64, Box<dyn Any>>>,
    next_reply: Cell<u64>,
}

impl SmpEndpoint {
    pub(crate) fn new(shard: ShardId, shared: Arc<SmpShared>) -> Self {
        let shards = shared.shards();
        Self {
            shard,
            shared,
            overflow: RefCell::new((0..shards).map(|_| VecDeque::new()).collect()),
            replies: RefCell::new(HashMap::new()),
            next_reply: Cell::new(0),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<SmpShared> {
        &self.shared
    }

    /// Parks `promise` until the reply tagged with the returned id arrives.
    pub(crate) fn expect_reply<T: 'static>(&self, promise: Promise<T>) -> u64 {
        let id = self.next_reply.get();
        self.next_reply.set(id + 1);
        self.replies.borrow_mut().insert(id, Box::new(promise));
        id
    }

    pub(crate) fn take_reply<T: 'static>(&self, id: u64) -> Option<Promise<T>> {
        let boxed = self.replies.borrow_mut().remove(&id)?;
        match boxed.downcast::<Promise<T>>() {
            Ok(promise) => Some(*promise),
            Err(_) => {
                tracing::error!(shard = %self.shard, reply = id, "reply type mismatch");
                None
            }
        }
    }

    /// Queues `msg` for `dst`. Requests to a stopped shard are refused on
    /// the spot.
    pub(crate) fn send(&self, dst: ShardId, msg: SmpMessage) {
        if msg.kind == MessageKind::Request && dst != self.shard && self.shared.is_stopped(dst) {
            (msg.run)(Admission::Rejected);
            return;
        }
        let mut overflow = self.overflow.borrow_mut();
        let backlog = &mut overflow[dst.index()];
        if backlog.is_empty() {
            if let Err(msg) = self.shared.queue(self.shard, dst).push(msg) {
                tracing::trace!(src = %self.shard, dst = %dst, "smp queue full; message parked");
                backlog.push_back(msg);
            }
        } else {
            backlog.push_back(msg);
        }
        drop(overflow);
        // Pairs with the fence in `mark_stopped`: either the destination's
        // final drain sees the message or this check sees the stop.
        fence(Ordering::SeqCst);
        if dst != self.shard && self.shared.is_stopped(dst) {
            self.refuse_stopped(dst);
            return;
        }
        self.shared.wake(dst);
    }

    /// Takes back everything queued or parked for the stopped shard `dst`.
    /// Requests are refused; replies have nobody left to receive them.
    fn refuse_stopped(&self, dst: ShardId) {
        let queue = self.shared.queue(self.shard, dst);
        let mut refused = Vec::new();
        while let Some(msg) = queue.pop() {
            refused.push(msg);
        }
        refused.extend(self.overflow.borrow_mut()[dst.index()].drain(..));
        if refused.is_empty() {
            return;
        }
        tracing::debug!(src = %self.shard, dst = %dst, messages = refused.len(), "refusing messages for stopped shard");
        for msg in refused {
            match msg.kind {
                MessageKind::Request => (msg.run)(Admission::Rejected),
                MessageKind::Reply => {
                    tracing::trace!(src = %self.shard, dst = %dst, "reply to stopped shard dropped");
                }
            }
        }
    }

    fn flush_overflow(&self) -> bool {
        let stopped: Vec<ShardId> = (0..self.shared.shards())
            .map(shard_at)
            .filter(|&dst| {
                dst != self.shard
                    && self.shared.is_stopped(dst)
                    && !self.overflow.borrow()[dst.index()].is_empty()
            })
            .collect();
        for dst in stopped {
            self.refuse_stopped(dst);
        }
        let mut moved = false;
        let mut overflow = self.overflow.borrow_mut();
        for (dst, backlog) in overflow.iter_mut().enumerate() {
            let dst_id = shard_at(dst);
            let queue = self.shared.queue(self.shard, dst_id);
            let mut pushed = false;
            while let Some(msg) = backlog.pop_front() {
                match queue.push(msg) {
                    Ok(()) => pushed = true,
                    Err(msg) => {
                        backlog.push_front(msg);
                        break;
                    }
                }
            }
            if pushed {
                moved = true;
                self.shared.wake(dst_id);
            }
        }
        moved
    }

    fn drain_inbound(&self, accepting: bool) -> bool {
        let Some(core) = local::current() else {
            return false;
        };
        let mut received = false;
        for src in 0..self.shared.shards() {
            let src_id = shard_at(src);
            let queue = self.shared.queue(src_id, self.shard);
            while let Some(msg) = queue.pop() {
                received = true;
                let admission = if msg.kind == MessageKind::Reply || accepting {
                    Admission::Accepted
                } else {
                    Admission::Rejected
                };
                let run = msg.run;
                core.schedule(
                    crate::types::GroupId::DEFAULT,
                    Box::new(move || run(admission)),
                );
            }
        }
        received
    }

    /// Announces an imminent sleep. Returns false if messages already
    /// arrived, in which case the caller must not sleep.
    pub(crate) fn prepare_sleep(&self) -> bool {
        self.shared.sleeping[self.shard.index()].store(true, Ordering::SeqCst);
        let empty = (0..self.shared.shards()).all(|src| {
            self.shared
                .queue(shard_at(src), self.shard)
                .is_empty()
        });
        let stopping = self.shared.stop_requested.load(Ordering::SeqCst)
            && local::current().is_some_and(|c| c.is_accepting());
        if !empty || stopping {
            self.finish_sleep();
            return false;
        }
        true
    }

    pub(crate) fn finish_sleep(&self) {
        self.shared.sleeping[self.shard.index()].store(false, Ordering::SeqCst);
    }

    /// Marks the shard stopped and refuses whatever requests are still
    /// queued for it.
    pub(crate) fn mark_stopped(&self) {
        self.shared.stopped[self.shard.index()].store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        for src in 0..self.shared.shards() {
            let src_id = shard_at(src);
            while let Some(msg) = self.shared.queue(src_id, self.shard).pop() {
                if msg.kind == MessageKind::Request {
                    (msg.run)(Admission::Rejected);
                }
            }
        }
        self.flush_overflow();
    }

    pub(crate) fn outstanding_replies(&self) -> usize {
        self.replies.borrow().len()
    }
}

impl PollSource for SmpEndpoint {
    fn poll(&self, _now: Time) -> bool {
        let accepting = local::current().is_some_and(|c| c.is_accepting());
        if accepting && self.shared.stop_requested.load(Ordering::SeqCst) {
            if let Some(core) = local::current() {
                core.request_stop();
            }
        }
        let flushed = self.flush_overflow();
        let received = self.drain_inbound(accepting && !self.shared.stop_requested.load(Ordering::SeqCst));
        flushed || received
    }

    fn has_pending(&self) -> bool {
        self.overflow.borrow().iter().any(|q| !q.is_empty())
    }

    fn name(&self) -> &str {
        "smp"
    }
}

impl fmt::Debug for SmpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmpEndpoint")
            .field("shard", &self.shard)
            .field("outstanding_replies", &self.outstanding_replies())
            .finish_non_exhaustive()
    }
}
