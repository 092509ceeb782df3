//! Stall detection.
//!
//! A task that runs longer than the configured threshold without returning
//! to the reactor blocks every other task on its shard. The detector
//! measures each task against the threshold and reports overruns through
//! `tracing::warn!`, a counter, and an optional callback. Reports are
//! rate-limited; suppressed stalls are still counted.

use crate::types::{GroupId, ShardId, TaskId, Time};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for stall detection.
#[derive(Debug, Clone)]
pub struct StallConfig {
    /// Whether detection is enabled.
    pub enabled: bool,
    /// A task running longer than this is a stall.
    pub threshold: Duration,
    /// Minimum time between two reports.
    pub min_report_interval: Duration,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: Duration::from_millis(25),
            min_report_interval: Duration::from_secs(1),
        }
    }
}

/// A stall observed on a shard.
#[derive(Debug, Clone)]
pub struct StallReport {
    /// Shard the stall happened on.
    pub shard: ShardId,
    /// The offending task.
    pub task: TaskId,
    /// Group the task ran in.
    pub group: GroupId,
    /// How long the task ran.
    pub elapsed: Duration,
    /// The configured threshold.
    pub threshold: Duration,
    /// Stalls that were counted but not reported since the last report.
    pub suppressed: u64,
}

/// Callback invoked for every reported stall.
pub type StallHandler = Arc<dyn Fn(&StallReport) + Send + Sync>;

pub(crate) struct StallDetector {
    config: StallConfig,
    handler: Option<StallHandler>,
    stalls: u64,
    suppressed: u64,
    last_report: Option<Time>,
}

impl fmt::Debug for StallDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StallDetector")
            .field("config", &self.config)
            .field("stalls", &self.stalls)
            .field("suppressed", &self.suppressed)
            .finish_non_exhaustive()
    }
}

impl StallDetector {
    pub(crate) fn new(config: StallConfig, handler: Option<StallHandler>) -> Self {
        Self {
            config,
            handler,
            stalls: 0,
            suppressed: 0,
            last_report: None,
        }
    }

    pub(crate) fn stalls(&self) -> u64 {
        self.stalls
    }

    /// Checks one task run. Returns the report and the handler to invoke,
    /// so the caller can run the handler without holding a borrow.
    pub(crate) fn check(
        &mut self,
        shard: ShardId,
        task: TaskId,
        group: GroupId,
        started: Time,
        finished: Time,
    ) -> Option<(StallReport, Option<StallHandler>)> {
        if !self.config.enabled {
            return None;
        }
        let elapsed = finished - started;
        if elapsed <= self.config.threshold {
            return None;
        }
        self.stalls += 1;
        if let Some(last) = self.last_report {
            if finished - last < self.config.min_report_interval {
                self.suppressed += 1;
                return None;
            }
        }
        self.last_report = Some(finished);
        let report = StallReport {
            shard,
            task,
            group,
            elapsed,
            threshold: self.config.threshold,
            suppressed: std::mem::take(&mut self.suppressed),
        };
        tracing::warn!(
            shard = %shard,
            task = %task,
            group = %group,
            elapsed_us = elapsed.as_micros() as u64,
            threshold_us = self.config.threshold.as_micros() as u64,
            suppressed = report.suppressed,
            "reactor stalled"
        );
        Some((report, self.handler.clone()))
    }
}
