//! Weighted scheduling groups.
//!
//! Every group owns a FIFO of tasks and a virtual runtime. Running a batch
//! of a group's tasks for `t` nanoseconds advances its virtual runtime by
//! `t * SHARE_SCALE / shares`, and the runnable group with the smallest
//! virtual runtime runs next (ties go to the lower group id). Over any
//! window where a set of groups stays runnable, each receives CPU time
//! roughly proportional to its shares.
//!
//! A group that becomes runnable after idling has its virtual runtime
//! lifted to the scheduler floor, so sleeping never accumulates credit.

use crate::error::{Error, ErrorKind, Result};
use crate::runtime::task::Task;
use crate::types::GroupId;
use std::collections::VecDeque;
use std::time::Duration;

/// Shares that make virtual runtime advance at wall-clock rate.
pub const SHARE_SCALE: u64 = 1000;

/// Per-group counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStats {
    /// Group name.
    pub name: String,
    /// Current shares.
    pub shares: u32,
    /// Current virtual runtime.
    pub vruntime: u64,
    /// Tasks waiting to run.
    pub queued: usize,
    /// Tasks run so far.
    pub tasks_run: u64,
    /// CPU time charged to the group.
    pub runtime: Duration,
    /// Batches the group was picked for.
    pub batches: u64,
}

#[derive(Debug)]
struct GroupEntry {
    name: String,
    shares: u32,
    vruntime: u64,
    queue: VecDeque<Task>,
    tasks_run: u64,
    runtime_ns: u64,
    batches: u64,
}

impl GroupEntry {
    fn new(name: String, shares: u32) -> Self {
        Self {
            name,
            shares,
            vruntime: 0,
            queue: VecDeque::new(),
            tasks_run: 0,
            runtime_ns: 0,
            batches: 0,
        }
    }
}

#[derive(Debug)]
struct Slot {
    generation: u16,
    entry: Option<GroupEntry>,
}

/// The group registry and run queues of one shard.
///
/// Destroyed slots are reused by later groups under a bumped generation.
#[derive(Debug)]
pub(crate) struct GroupScheduler {
    slots: Vec<Slot>,
    max_groups: usize,
    floor: u64,
    queued: usize,
}

impl GroupScheduler {
    pub(crate) fn new(default_shares: u32, max_groups: usize) -> Self {
        Self {
            slots: vec![Slot {
                generation: 0,
                entry: Some(GroupEntry::new("default".to_string(), default_shares.max(1))),
            }],
            max_groups: max_groups.max(1),
            floor: 0,
            queued: 0,
        }
    }

    fn entry(&self, id: GroupId) -> Result<&GroupEntry> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.entry.as_ref())
            .ok_or_else(|| invalid_group(id))
    }

    fn entry_mut(&mut self, id: GroupId) -> Result<&mut GroupEntry> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.entry.as_mut())
            .ok_or_else(|| invalid_group(id))
    }

    fn id_of(&self, index: usize) -> Option<GroupId> {
        let slot = self.slots.get(index)?;
        Some(GroupId::from_parts(u16::try_from(index).ok()?, slot.generation))
    }

    pub(crate) fn contains(&self, id: GroupId) -> bool {
        self.entry(id).is_ok()
    }

    pub(crate) fn live_groups(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    pub(crate) fn create(&mut self, name: &str, shares: u32) -> Result<GroupId> {
        if shares == 0 {
            return Err(Error::new(ErrorKind::InvalidGroup)
                .with_message(format!("group {name:?} needs at least one share")));
        }
        if self.live_groups() >= self.max_groups {
            return Err(Error::new(ErrorKind::InvalidGroup).with_message(format!(
                "scheduling group limit of {} reached",
                self.max_groups
            )));
        }
        let mut entry = GroupEntry::new(name.to_string(), shares);
        entry.vruntime = self.floor;
        if let Some(index) = self.slots.iter().position(|slot| slot.entry.is_none()) {
            let slot = &mut self.slots[index];
            slot.generation = slot.generation.wrapping_add(1);
            slot.entry = Some(entry);
            return self.id_of(index).ok_or_else(exhausted);
        }
        let index = self.slots.len();
        if u16::try_from(index).is_err() {
            return Err(exhausted());
        }
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        self.id_of(index).ok_or_else(exhausted)
    }

    pub(crate) fn destroy(&mut self, id: GroupId) -> Result<()> {
        if id == GroupId::DEFAULT {
            return Err(Error::new(ErrorKind::InvalidGroup)
                .with_message("the default scheduling group cannot be destroyed"));
        }
        let entry = self.entry(id)?;
        if !entry.queue.is_empty() {
            return Err(Error::new(ErrorKind::GroupBusy).with_message(format!(
                "group {id} still has {} queued tasks",
                entry.queue.len()
            )));
        }
        self.slots[id.index()].entry = None;
        Ok(())
    }

    pub(crate) fn set_shares(&mut self, id: GroupId, shares: u32) -> Result<()> {
        if shares == 0 {
            return Err(Error::new(ErrorKind::InvalidGroup)
                .with_message("a group needs at least one share"));
        }
        self.entry_mut(id)?.shares = shares;
        Ok(())
    }

    pub(crate) fn find(&self, name: &str) -> Option<GroupId> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.entry.as_ref().is_some_and(|g| g.name == name))?;
        self.id_of(index)
    }

    pub(crate) fn name(&self, id: GroupId) -> Option<&str> {
        self.entry(id).ok().map(|g| g.name.as_str())
    }

    /// Queues a task on its group. Tasks aimed at a destroyed group land in
    /// the default group.
    pub(crate) fn push(&mut self, mut task: Task) {
        if !self.contains(task.group) {
            tracing::warn!(
                task = %task.id,
                group = %task.group,
                "task scheduled on a destroyed group; running it in the default group"
            );
            task.group = GroupId::DEFAULT;
        }
        let floor = self.floor;
        let Ok(entry) = self.entry_mut(task.group) else {
            return;
        };
        if entry.queue.is_empty() {
            entry.vruntime = entry.vruntime.max(floor);
        }
        entry.queue.push_back(task);
        self.queued += 1;
    }

    pub(crate) fn has_runnable(&self) -> bool {
        self.queued > 0
    }

    pub(crate) fn queued(&self) -> usize {
        self.queued
    }

    pub(crate) fn queued_in(&self, id: GroupId) -> usize {
        self.entry(id).map_or(0, |g| g.queue.len())
    }

    /// Picks the runnable group with the smallest virtual runtime.
    pub(crate) fn pick_next(&mut self) -> Option<GroupId> {
        let (index, vruntime) = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                slot.entry
                    .as_ref()
                    .filter(|g| !g.queue.is_empty())
                    .map(|g| (i, g.vruntime))
            })
            .min_by_key(|&(i, v)| (v, i))?;
        self.floor = self.floor.max(vruntime);
        let id = self.id_of(index)?;
        if let Ok(entry) = self.entry_mut(id) {
            entry.batches += 1;
        }
        Some(id)
    }

    pub(crate) fn pop(&mut self, id: GroupId) -> Option<Task> {
        let task = self.entry_mut(id).ok()?.queue.pop_front()?;
        self.queued -= 1;
        Some(task)
    }

    /// Charges `elapsed_ns` of CPU time and `tasks` task runs to `id`.
    pub(crate) fn charge(&mut self, id: GroupId, elapsed_ns: u64, tasks: u64) {
        let Ok(entry) = self.entry_mut(id) else {
            return;
        };
        let delta = elapsed_ns.saturating_mul(SHARE_SCALE) / u64::from(entry.shares);
        entry.vruntime = entry.vruntime.saturating_add(delta);
        entry.runtime_ns = entry.runtime_ns.saturating_add(elapsed_ns);
        entry.tasks_run += tasks;
    }

    pub(crate) fn stats(&self, id: GroupId) -> Result<GroupStats> {
        let g = self.entry(id)?;
        Ok(GroupStats {
            name: g.name.clone(),
            shares: g.shares,
            vruntime: g.vruntime,
            queued: g.queue.len(),
            tasks_run: g.tasks_run,
            runtime: Duration::from_nanos(g.runtime_ns),
            batches: g.batches,
        })
    }

    /// Drops every queued task. Used when the reactor is torn down.
    pub(crate) fn drain(&mut self) -> Vec<Task> {
        self.queued = 0;
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.entry.as_mut())
            .flat_map(|g| g.queue.drain(..))
            .collect()
    }
}

fn exhausted() -> Error {
    Error::new(ErrorKind::InvalidGroup).with_message("group id space exhausted")
}

fn invalid_group(id: GroupId) -> Error {
    Error::new(ErrorKind::InvalidGroup).with_message(format!("no scheduling group {id}"))
}
