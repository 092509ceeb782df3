//! Time sources.
//!
//! Every reactor reads time through a [`ClockSource`]. Production shards
//! share one [`WallClock`] so that timestamps are comparable across shards
//! (the shared I/O token bucket depends on it). Tests use a
//! [`VirtualClock`] that only moves when told to, or when an idle reactor
//! skips ahead to its next timer.

use crate::types::Time;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Time source abstraction.
pub trait TimeSource: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Time;
}

/// Wall clock time source.
///
/// The epoch is the instant the clock was created.
#[derive(Debug)]
pub struct WallClock {
    epoch: std::time::Instant,
}

impl WallClock {
    /// Creates a new wall clock time source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for WallClock {
    fn now(&self) -> Time {
        let elapsed = self.epoch.elapsed();
        Time::from_nanos(u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
    }
}

/// Virtual time source for deterministic tests.
///
/// # Example
///
/// ```
/// use percore::time::{TimeSource, VirtualClock};
/// use percore::types::Time;
///
/// let clock = VirtualClock::new();
/// assert_eq!(clock.now(), Time::ZERO);
///
/// clock.advance(1_000_000_000);
/// assert_eq!(clock.now(), Time::from_secs(1));
/// ```
#[derive(Debug, Default)]
pub struct VirtualClock {
    now: AtomicU64,
}

impl VirtualClock {
    /// Creates a new virtual clock starting at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
        }
    }

    /// Creates a virtual clock starting at the given time.
    #[must_use]
    pub fn starting_at(time: Time) -> Self {
        Self {
            now: AtomicU64::new(time.as_nanos()),
        }
    }

    /// Advances time by the given number of nanoseconds.
    pub fn advance(&self, nanos: u64) {
        self.now.fetch_add(nanos, Ordering::Release);
    }

    /// Advances time to `time`. Moving backwards is a no-op.
    pub fn advance_to(&self, time: Time) {
        self.now.fetch_max(time.as_nanos(), Ordering::AcqRel);
    }

    /// Sets the current time.
    pub fn set(&self, time: Time) {
        self.now.store(time.as_nanos(), Ordering::Release);
    }
}

impl TimeSource for VirtualClock {
    fn now(&self) -> Time {
        Time::from_nanos(self.now.load(Ordering::Acquire))
    }
}

/// The clock a reactor runs on.
#[derive(Clone)]
pub struct ClockSource {
    source: Arc<dyn TimeSource>,
    virtual_clock: Option<Arc<VirtualClock>>,
}

impl ClockSource {
    /// A fresh wall clock.
    #[must_use]
    pub fn wall() -> Self {
        Self::from_wall(Arc::new(WallClock::new()))
    }

    /// A shared wall clock.
    #[must_use]
    pub fn from_wall(clock: Arc<WallClock>) -> Self {
        Self {
            source: clock,
            virtual_clock: None,
        }
    }

    /// A virtual clock; idle reactors skip ahead to their next timer.
    #[must_use]
    pub fn from_virtual(clock: Arc<VirtualClock>) -> Self {
        Self {
            source: clock.clone(),
            virtual_clock: Some(clock),
        }
    }

    /// Returns the current time.
    #[must_use]
    pub fn now(&self) -> Time {
        self.source.now()
    }

    /// Returns true if time only moves when advanced explicitly.
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        self.virtual_clock.is_some()
    }

    /// Moves a virtual clock forward to `time`. Returns false for the wall
    /// clock.
    pub fn advance_to(&self, time: Time) -> bool {
        match &self.virtual_clock {
            Some(clock) => {
                clock.advance_to(time);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for ClockSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClockSource")
            .field("virtual", &self.is_virtual())
            .field("now", &self.now())
            .finish()
    }
}
