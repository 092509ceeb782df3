//! Time sources, sleeping and deadlines.
//!
//! - [`clock`]: [`TimeSource`], [`WallClock`], [`VirtualClock`] and the
//!   reactor-facing [`ClockSource`]
//! - [`sleep`](mod@sleep): [`sleep()`], [`sleep_until`], [`with_timeout`] and [`Timer`]
//!
//! Timers live in the reactor of the calling shard; their callbacks run as
//! tasks in the scheduling group that armed them.

pub mod clock;
pub mod sleep;

pub use clock::{ClockSource, TimeSource, VirtualClock, WallClock};
pub use sleep::{sleep, sleep_until, with_timeout, Timer};
