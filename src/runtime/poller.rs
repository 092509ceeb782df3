//! Readiness polling and pluggable poll sources.
//!
//! Each shard owns one [`polling::Poller`]. It serves two purposes: file
//! descriptor readiness for callers that register interest, and the idle
//! sleep of the reactor, which other shards interrupt with
//! [`Poller::notify`](polling::Poller::notify) after queueing a message.
//!
//! Registrations are oneshot: after an event fires the callback runs as a
//! task and the registration is re-armed once it returns.

use crate::error::{Error, Result};
use crate::types::{GroupId, Time};
use polling::{Event, Poller};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

/// Something the reactor polls on every turn.
///
/// I/O queues and the cross-shard inbox are poll sources. Implementations
/// use interior mutability: the reactor only holds shared handles.
pub trait PollSource {
    /// Makes progress. Returns true if any work was done.
    fn poll(&self, now: Time) -> bool;

    /// Returns true if the source expects to make progress later without
    /// outside help (e.g. requests in flight).
    fn has_pending(&self) -> bool {
        false
    }

    /// Earliest time at which the source can make progress, if known.
    fn next_deadline(&self) -> Option<Time> {
        None
    }

    /// Name used in logs.
    fn name(&self) -> &str;
}

/// Readiness a caller is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    /// Wake when readable.
    pub readable: bool,
    /// Wake when writable.
    pub writable: bool,
}

impl Interest {
    /// Readable only.
    pub const READABLE: Self = Self {
        readable: true,
        writable: false,
    };
    /// Writable only.
    pub const WRITABLE: Self = Self {
        readable: false,
        writable: true,
    };
    /// Readable and writable.
    pub const BOTH: Self = Self {
        readable: true,
        writable: true,
    };

    fn event(self, key: usize) -> Event {
        match (self.readable, self.writable) {
            (true, true) => Event::all(key),
            (true, false) => Event::readable(key),
            (false, true) => Event::writable(key),
            (false, false) => Event::none(key),
        }
    }
}

/// Readiness reported to a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// The descriptor is readable.
    pub readable: bool,
    /// The descriptor is writable.
    pub writable: bool,
}

/// Handle of a readiness registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadinessToken(usize);

pub(crate) type ReadinessCallback = Rc<RefCell<Box<dyn FnMut(Readiness)>>>;

struct Registration {
    #[cfg(unix)]
    fd: std::os::unix::io::RawFd,
    interest: Interest,
    group: GroupId,
    callback: ReadinessCallback,
}

/// A fired registration, ready to be scheduled.
pub(crate) struct Fired {
    pub(crate) token: ReadinessToken,
    pub(crate) group: GroupId,
    pub(crate) callback: ReadinessCallback,
    pub(crate) readiness: Readiness,
}

pub(crate) struct ReadinessPoller {
    poller: Arc<Poller>,
    registrations: RefCell<HashMap<usize, Registration>>,
    next_key: Cell<usize>,
    events: RefCell<Vec<Event>>,
}

impl ReadinessPoller {
    pub(crate) fn new() -> Result<Self> {
        Ok(Self::with_poller(Arc::new(Poller::new().map_err(Error::io)?)))
    }

    pub(crate) fn with_poller(poller: Arc<Poller>) -> Self {
        Self {
            poller,
            registrations: RefCell::new(HashMap::new()),
            next_key: Cell::new(1),
            events: RefCell::new(Vec::new()),
        }
    }

    /// The underlying poller, for cross-shard wakeups.
    pub(crate) fn handle(&self) -> Arc<Poller> {
        Arc::clone(&self.poller)
    }

    pub(crate) fn has_registrations(&self) -> bool {
        !self.registrations.borrow().is_empty()
    }

    #[cfg(unix)]
    pub(crate) fn register(
        &self,
        fd: std::os::unix::io::RawFd,
        interest: Interest,
        group: GroupId,
        callback: Box<dyn FnMut(Readiness)>,
    ) -> Result<ReadinessToken> {
        let key = self.next_key.get();
        self.next_key.set(key + 1);
        self.poller
            .add(fd, interest.event(key))
            .map_err(Error::io)?;
        self.registrations.borrow_mut().insert(
            key,
            Registration {
                fd,
                interest,
                group,
                callback: Rc::new(RefCell::new(callback)),
            },
        );
        Ok(ReadinessToken(key))
    }

    #[cfg(unix)]
    pub(crate) fn deregister(&self, token: ReadinessToken) -> Result<()> {
        let registration = self
            .registrations
            .borrow_mut()
            .remove(&token.0)
            .ok_or_else(|| Error::invalid_state("readiness token is not registered"))?;
        self.poller.delete(registration.fd).map_err(Error::io)
    }

    /// Re-arms a oneshot registration after its callback ran.
    #[cfg(unix)]
    pub(crate) fn rearm(&self, token: ReadinessToken) {
        let regs = self.registrations.borrow();
        let Some(reg) = regs.get(&token.0) else {
            return;
        };
        if let Err(err) = self.poller.modify(reg.fd, reg.interest.event(token.0)) {
            tracing::warn!(error = %err, key = token.0, "failed to re-arm readiness registration");
        }
    }

    #[cfg(not(unix))]
    pub(crate) fn rearm(&self, _token: ReadinessToken) {}

    /// Waits up to `timeout` for readiness or a cross-shard notification.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Result<Vec<Fired>> {
        let mut events = self.events.borrow_mut();
        events.clear();
        match self.poller.wait(&mut events, timeout) {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(err) => return Err(Error::io(err)),
        }
        let regs = self.registrations.borrow();
        Ok(events
            .iter()
            .filter_map(|ev| {
                regs.get(&ev.key).map(|reg| Fired {
                    token: ReadinessToken(ev.key),
                    group: reg.group,
                    callback: Rc::clone(&reg.callback),
                    readiness: Readiness {
                        readable: ev.readable,
                        writable: ev.writable,
                    },
                })
            })
            .collect())
    }
}
