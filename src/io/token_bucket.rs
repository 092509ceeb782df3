//! Token bucket shared by every shard that uses a device.
//!
//! The bucket is two monotonically growing rovers. `tail` counts every token
//! ever grabbed, `head` every token ever made available. Grabbing is a
//! single `fetch_add` on `tail`; the grabber owns the tokens once `head`
//! has caught up with the tail value it got back. Replenishing moves `head`
//! forward at the configured rate, never further than `limit` tokens past
//! the current tail, so an idle device banks at most one burst.

use crate::types::Time;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Lock-free token bucket.
pub struct SharedTokenBucket {
    rate: u64,
    limit: u64,
    threshold: u64,
    head: AtomicU64,
    tail: AtomicU64,
    replenished_at: AtomicU64,
}

impl SharedTokenBucket {
    /// Creates a full bucket.
    ///
    /// `rate` is in tokens per second and must be positive, `limit` caps
    /// the burst, `threshold` is the smallest amount worth replenishing.
    #[must_use]
    pub fn new(rate: u64, limit: u64, threshold: u64, now: Time) -> Self {
        let limit = limit.max(1);
        Self {
            rate: rate.max(1),
            limit,
            threshold: threshold.clamp(1, limit),
            head: AtomicU64::new(limit),
            tail: AtomicU64::new(0),
            replenished_at: AtomicU64::new(now.as_nanos()),
        }
    }

    /// Tokens per second.
    #[must_use]
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Burst limit.
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Replenish threshold.
    #[must_use]
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Total tokens made available so far, including the initial burst.
    #[must_use]
    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Total tokens grabbed so far.
    #[must_use]
    pub fn tail(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    /// Reserves `tokens` and returns the tail position that must be covered
    /// before they may be used.
    pub fn grab(&self, tokens: u64) -> u64 {
        self.tail.fetch_add(tokens, Ordering::AcqRel) + tokens
    }

    /// How many tokens are still missing before `tail` is covered.
    #[must_use]
    pub fn deficiency(&self, tail: u64) -> u64 {
        tail.saturating_sub(self.head())
    }

    /// Tokens available right now without waiting.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.head().saturating_sub(self.tail())
    }

    /// Tokens accumulated over `elapsed`.
    #[must_use]
    pub fn tokens_for(&self, elapsed: Duration) -> u64 {
        let tokens = elapsed.as_nanos() * u128::from(self.rate) / NANOS_PER_SEC;
        u64::try_from(tokens).unwrap_or(u64::MAX)
    }

    /// Time it takes to accumulate `tokens`, rounded up.
    #[must_use]
    pub fn duration_for(&self, tokens: u64) -> Duration {
        let nanos = (u128::from(tokens) * NANOS_PER_SEC).div_ceil(u128::from(self.rate));
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Adds the tokens accumulated since the last replenish.
    ///
    /// Concurrent callers race on the timestamp; only the winner adds
    /// tokens. Returns the number of tokens added.
    pub fn replenish(&self, now: Time) -> u64 {
        let last = self.replenished_at.load(Ordering::Acquire);
        let now_ns = now.as_nanos();
        if now_ns <= last {
            return 0;
        }
        let extra = self.tokens_for(Duration::from_nanos(now_ns - last));
        if extra < self.threshold {
            return 0;
        }
        // Advance by the time the credited tokens took, so the fraction of a
        // token left over is credited next time.
        let spent = u64::try_from(u128::from(extra) * NANOS_PER_SEC / u128::from(self.rate))
            .unwrap_or(u64::MAX);
        let next = last.saturating_add(spent).min(now_ns);
        if self
            .replenished_at
            .compare_exchange(last, next, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return 0;
        }
        let cap = self.tail().saturating_add(self.limit);
        let mut added = 0;
        let _ = self
            .head
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |head| {
                let new_head = head.saturating_add(extra).min(cap);
                if new_head <= head {
                    added = 0;
                    None
                } else {
                    added = new_head - head;
                    Some(new_head)
                }
            });
        added
    }

    /// Earliest time at which `tail` would be covered, given no one else
    /// grabs in between.
    #[must_use]
    pub fn ready_at(&self, tail: u64) -> Time {
        let missing = self.deficiency(tail);
        let base = Time::from_nanos(self.replenished_at.load(Ordering::Acquire));
        if missing == 0 {
            return base;
        }
        base + self.duration_for(missing.max(self.threshold))
    }
}

impl fmt::Debug for SharedTokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedTokenBucket")
            .field("rate", &self.rate)
            .field("limit", &self.limit)
            .field("threshold", &self.threshold)
            .field("head", &self.head())
            .field("tail", &self.tail())
            .finish()
    }
}
