//! Per-shard I/O queue of one device.
//!
//! Requests enter a [`FairQueue`] under a priority class and leave it for
//! the backend when the device has capacity. The queue is a reactor poll
//! source: every turn it collects backend completions, resolves their
//! futures, and dispatches whatever the freed capacity allows.

use crate::error::{Error, Result};
use crate::future::{Future, Promise};
use crate::io::backend::{BackendCompletion, BackendRequest, IoBackend, IoCompletion, IoOp};
use crate::io::device::IoDevice;
use crate::io::fair_queue::{ClassStats, FairQueue};
use crate::runtime::poller::PollSource;
use crate::sync::{AbortSource, AbortSubscription};
use crate::types::{ClassId, RequestId, Time};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// An I/O request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoRequest {
    op: IoOp,
    cost: Option<u64>,
}

impl IoRequest {
    /// Reads `len` bytes at `pos`.
    #[must_use]
    pub fn read(pos: u64, len: usize) -> Self {
        Self {
            op: IoOp::Read { pos, len },
            cost: None,
        }
    }

    /// Writes `data` at `pos`.
    #[must_use]
    pub fn write(pos: u64, data: Vec<u8>) -> Self {
        Self {
            op: IoOp::Write { pos, data },
            cost: None,
        }
    }

    /// Flushes earlier writes.
    #[must_use]
    pub fn flush() -> Self {
        Self {
            op: IoOp::Flush,
            cost: None,
        }
    }

    /// Overrides the cost computed from the device's cost model.
    #[must_use]
    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = Some(cost);
        self
    }

    /// The operation.
    #[must_use]
    pub fn op(&self) -> &IoOp {
        &self.op
    }
}

/// Counters of one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoQueueStats {
    /// Requests accepted.
    pub submitted: u64,
    /// Requests refused because the queue was full.
    pub rejected: u64,
    /// Requests completed successfully.
    pub completed: u64,
    /// Requests the backend failed.
    pub failed: u64,
    /// Requests aborted before completing.
    pub aborted: u64,
    /// Requests waiting for capacity.
    pub queued: usize,
    /// Requests at the backend.
    pub in_flight: usize,
}

struct Pending {
    promise: Promise<IoCompletion>,
    op: IoOp,
    _abort: Option<AbortSubscription>,
}

struct InFlight {
    promise: Promise<IoCompletion>,
    _abort: Option<AbortSubscription>,
}

struct Inner {
    device: Arc<IoDevice>,
    fq: RefCell<FairQueue<Pending>>,
    backend: RefCell<Box<dyn IoBackend>>,
    in_flight: RefCell<HashMap<RequestId, InFlight>>,
    completions: RefCell<Vec<BackendCompletion>>,
    next_id: Cell<u64>,
    stats: RefCell<IoQueueStats>,
}

/// Shard-local handle to a device queue. Clones share the queue.
#[derive(Clone)]
pub struct IoQueue {
    inner: Rc<Inner>,
}

impl IoQueue {
    /// Creates a queue on `device` with the device's configured backend and
    /// classes.
    pub fn new(device: Arc<IoDevice>) -> Result<Self> {
        let backend = device.open_backend()?;
        Self::with_backend(device, backend)
    }

    /// Creates a queue on `device` executing through `backend`.
    pub fn with_backend(device: Arc<IoDevice>, backend: Box<dyn IoBackend>) -> Result<Self> {
        let mut fq = FairQueue::new(Arc::clone(device.group()), device.config().bank_limit);
        for class in &device.config().classes {
            fq.register_class(&class.name, class.shares)?;
        }
        tracing::debug!(device = %device.name(), backend = backend.name(), "I/O queue created");
        Ok(Self {
            inner: Rc::new(Inner {
                device,
                fq: RefCell::new(fq),
                backend: RefCell::new(backend),
                in_flight: RefCell::new(HashMap::new()),
                completions: RefCell::new(Vec::new()),
                next_id: Cell::new(0),
                stats: RefCell::new(IoQueueStats::default()),
            }),
        })
    }

    /// The device behind this queue.
    #[must_use]
    pub fn device(&self) -> &Arc<IoDevice> {
        &self.inner.device
    }

    /// Registers another priority class on this shard's queue.
    pub fn register_class(&self, name: &str, shares: u32) -> Result<ClassId> {
        self.inner.fq.borrow_mut().register_class(name, shares)
    }

    /// Removes a priority class. Fails while requests are queued on it.
    pub fn unregister_class(&self, class: ClassId) -> Result<()> {
        self.inner.fq.borrow_mut().unregister_class(class)
    }

    /// Changes the shares of a priority class.
    pub fn set_shares(&self, class: ClassId, shares: u32) -> Result<()> {
        self.inner.fq.borrow_mut().set_shares(class, shares)
    }

    /// Looks a priority class up by name.
    #[must_use]
    pub fn find_class(&self, name: &str) -> Option<ClassId> {
        self.inner.fq.borrow().find_class(name)
    }

    /// Counters of one priority class.
    pub fn class_stats(&self, class: ClassId) -> Result<ClassStats> {
        self.inner.fq.borrow().class_stats(class)
    }

    /// Queue counters.
    #[must_use]
    pub fn stats(&self) -> IoQueueStats {
        let mut stats = self.inner.stats.borrow().clone();
        stats.queued = self.inner.fq.borrow().queued();
        stats.in_flight = self.inner.in_flight.borrow().len();
        stats
    }

    fn admit(&self, class: ClassId) -> Result<RequestId> {
        let fq = self.inner.fq.borrow();
        fq.class_stats(class)?;
        let limit = self.inner.device.config().max_queue_depth;
        if fq.queued() >= limit {
            self.inner.stats.borrow_mut().rejected += 1;
            tracing::debug!(device = %self.inner.device.name(), class = %class, limit, "I/O queue full");
            return Err(Error::queue_full(fq.queued(), limit));
        }
        let id = RequestId(self.inner.next_id.get());
        self.inner.next_id.set(id.0 + 1);
        Ok(id)
    }

    fn enqueue(
        &self,
        class: ClassId,
        id: RequestId,
        request: IoRequest,
        abort: Option<AbortSubscription>,
    ) -> Future<IoCompletion> {
        let mut promise = Promise::new();
        let fut = promise.future();
        let cost = request
            .cost
            .unwrap_or_else(|| self.inner.device.config().cost_of(&request.op));
        let pending = Pending {
            promise,
            op: request.op,
            _abort: abort,
        };
        if let Err(err) = self.inner.fq.borrow_mut().queue(class, id, cost, pending) {
            return Future::failed(err);
        }
        self.inner.stats.borrow_mut().submitted += 1;
        tracing::trace!(device = %self.inner.device.name(), class = %class, request = %id, cost, "I/O request queued");
        fut
    }

    /// Submits `request` under `class`.
    ///
    /// Fails fast with [`QueueFull`](crate::ErrorKind::QueueFull) once the
    /// device's queue depth is reached, and with
    /// [`InvalidClass`](crate::ErrorKind::InvalidClass) for an unknown
    /// class. Backend errors come back as [`Io`](crate::ErrorKind::Io)
    /// errors carrying the original OS code.
    pub fn submit(&self, class: ClassId, request: IoRequest) -> Future<IoCompletion> {
        match self.admit(class) {
            Ok(id) => self.enqueue(class, id, request, None),
            Err(err) => Future::failed(err),
        }
    }

    /// Like [`submit`](Self::submit), but resolves with an aborted error as
    /// soon as `abort` fires: a queued request is removed, an in-flight one
    /// is cancelled at the backend if the backend allows it.
    pub fn submit_abortable(
        &self,
        class: ClassId,
        request: IoRequest,
        abort: &AbortSource,
    ) -> Future<IoCompletion> {
        if abort.abort_requested() {
            return Future::failed(Error::aborted("I/O request aborted before submission"));
        }
        let id = match self.admit(class) {
            Ok(id) => id,
            Err(err) => return Future::failed(err),
        };
        let weak: Weak<Inner> = Rc::downgrade(&self.inner);
        let subscription = abort.subscribe(move || {
            if let Some(inner) = weak.upgrade() {
                IoQueue { inner }.abort_request(class, id);
            }
        });
        self.enqueue(class, id, request, subscription)
    }

    fn abort_request(&self, class: ClassId, id: RequestId) {
        let removed = self.inner.fq.borrow_mut().remove(class, id);
        if let Some(pending) = removed {
            self.inner.stats.borrow_mut().aborted += 1;
            tracing::debug!(request = %id, "queued I/O request aborted");
            pending
                .promise
                .set_error(Error::aborted("I/O request aborted while queued"));
            return;
        }
        if !self.inner.in_flight.borrow().contains_key(&id) {
            return;
        }
        if !self.inner.backend.borrow_mut().cancel(id) {
            return;
        }
        let entry = self.inner.in_flight.borrow_mut().remove(&id);
        if let Some(entry) = entry {
            self.inner.fq.borrow_mut().notify_finished();
            self.inner.stats.borrow_mut().aborted += 1;
            tracing::debug!(request = %id, "in-flight I/O request cancelled");
            entry
                .promise
                .set_error(Error::aborted("I/O request aborted in flight"));
        }
    }

    fn complete(&self, now: Time) -> bool {
        let mut done = std::mem::take(&mut *self.inner.completions.borrow_mut());
        self.inner.backend.borrow_mut().poll_completions(now, &mut done);
        let any = !done.is_empty();
        for completion in done.drain(..) {
            let entry = self.inner.in_flight.borrow_mut().remove(&completion.id);
            let Some(entry) = entry else {
                continue;
            };
            self.inner.fq.borrow_mut().notify_finished();
            match completion.result {
                Ok(value) => {
                    self.inner.stats.borrow_mut().completed += 1;
                    entry.promise.set_value(value);
                }
                Err(err) => {
                    self.inner.stats.borrow_mut().failed += 1;
                    tracing::debug!(request = %completion.id, error = %err, "I/O request failed");
                    entry.promise.set_error(Error::io(err));
                }
            }
        }
        *self.inner.completions.borrow_mut() = done;
        any
    }

    fn dispatch(&self, now: Time) -> bool {
        let mut batch = Vec::new();
        self.inner
            .fq
            .borrow_mut()
            .dispatch(now, |_, id, pending| batch.push((id, pending)));
        let any = !batch.is_empty();
        for (id, pending) in batch {
            self.inner.in_flight.borrow_mut().insert(
                id,
                InFlight {
                    promise: pending.promise,
                    _abort: pending._abort,
                },
            );
            self.inner
                .backend
                .borrow_mut()
                .submit(now, BackendRequest { id, op: pending.op });
        }
        any
    }
}

impl PollSource for IoQueue {
    fn poll(&self, now: Time) -> bool {
        let completed = self.complete(now);
        let dispatched = self.dispatch(now);
        completed || dispatched
    }

    fn has_pending(&self) -> bool {
        !self.inner.in_flight.borrow().is_empty() || self.inner.fq.borrow().queued() > 0
    }

    fn next_deadline(&self) -> Option<Time> {
        let backend = self.inner.backend.borrow().next_completion();
        let tokens = self.inner.fq.borrow().next_ready_time();
        match (backend, tokens) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn name(&self) -> &str {
        self.inner.device.name()
    }
}

impl fmt::Debug for IoQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoQueue")
            .field("device", &self.inner.device.name())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::io::device::IoDeviceConfig;
    use crate::test_utils::{init_test_logging, test_reactor};
    use crate::time::TimeSource;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn queue_depth_limit_fails_fast() {
        init_test("queue_depth_limit_fails_fast");
        let (reactor, clock) = test_reactor();
        let config = IoDeviceConfig {
            max_queue_depth: 2,
            max_in_flight: 1,
            ..IoDeviceConfig::new("slow")
        };
        let device = IoDevice::new(config, clock.now()).expect("device");
        let queue = IoQueue::new(device).expect("queue");
        let class = queue.find_class("default").expect("class");
        let q = queue.clone();
        let kinds = reactor
            .block_on(move || {
                let first = q.submit(class, IoRequest::flush());
                let second = q.submit(class, IoRequest::flush());
                let mut third = q.submit(class, IoRequest::flush());
                let rejected = third.try_take().map(|r| r.map_err(|e| e.kind()).err());
                first.ignore();
                second.ignore();
                Future::ready(rejected)
            })
            .expect("block_on");
        assert_eq!(kinds, Some(Some(ErrorKind::QueueFull)));
        assert_eq!(queue.stats().rejected, 1);
        crate::test_complete!("queue_depth_limit_fails_fast");
    }
}
