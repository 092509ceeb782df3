//! The unit of execution queued on a scheduling group.
//!
//! A task is a type-erased `FnOnce` bound to a group. Running it consumes
//! it; panics are caught at this boundary so a faulty continuation never
//! takes the shard down.

use crate::types::{GroupId, TaskId};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

pub(crate) type TaskFn = Box<dyn FnOnce()>;

pub(crate) struct Task {
    pub(crate) id: TaskId,
    pub(crate) group: GroupId,
    func: TaskFn,
}

impl Task {
    pub(crate) fn new(id: TaskId, group: GroupId, func: TaskFn) -> Self {
        Self { id, group, func }
    }

    /// Runs the task. Returns the panic message if it panicked.
    pub(crate) fn run(self) -> Result<(), String> {
        let Self { id, group, func } = self;
        tracing::trace!(task = %id, group = %group, "task started");
        catch_unwind(AssertUnwindSafe(func)).map_err(|payload| {
            payload
                .downcast_ref::<&'static str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string())
        })
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}
