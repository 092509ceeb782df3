//! I/O backends.
//!
//! A backend executes dispatched requests and reports their completions
//! when the owning [`IoQueue`](crate::io::IoQueue) polls it. Backends are
//! shard-local; the queue calls them from its reactor only.

use crate::types::{RequestId, Time};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// What a request does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoOp {
    /// Read up to `len` bytes at `pos`.
    Read {
        /// Byte offset.
        pos: u64,
        /// Bytes to read.
        len: usize,
    },
    /// Write `data` at `pos`.
    Write {
        /// Byte offset.
        pos: u64,
        /// Bytes to write.
        data: Vec<u8>,
    },
    /// Make earlier writes durable.
    Flush,
}

impl IoOp {
    /// Bytes moved by the operation.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Read { len, .. } => *len,
            Self::Write { data, .. } => data.len(),
            Self::Flush => 0,
        }
    }

    /// True for operations that move no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A successfully completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoCompletion {
    /// The request.
    pub id: RequestId,
    /// Bytes transferred.
    pub bytes: usize,
    /// Data read; empty for writes and flushes.
    pub data: Vec<u8>,
}

/// A request handed to a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRequest {
    /// The request.
    pub id: RequestId,
    /// What to do.
    pub op: IoOp,
}

/// Outcome reported by a backend.
#[derive(Debug)]
pub struct BackendCompletion {
    /// The request.
    pub id: RequestId,
    /// Success, or the backend's error unchanged.
    pub result: io::Result<IoCompletion>,
}

/// Executes dispatched requests.
pub trait IoBackend {
    /// Starts a request.
    fn submit(&mut self, now: Time, request: BackendRequest);

    /// Appends every request finished by `now` to `out`.
    fn poll_completions(&mut self, now: Time, out: &mut Vec<BackendCompletion>);

    /// Cancels a request that has not completed. Returns false if it is
    /// unknown or already done.
    fn cancel(&mut self, id: RequestId) -> bool;

    /// Requests submitted and not yet reported.
    fn in_flight(&self) -> usize;

    /// When the next in-flight request completes, if known.
    fn next_completion(&self) -> Option<Time> {
        None
    }

    /// Name for logs.
    fn name(&self) -> &str;
}

/// Latency model of a [`MemoryBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LatencyModel {
    /// Fixed time per request.
    pub base: Duration,
    /// Extra time per KiB moved.
    pub per_kib: Duration,
}

impl LatencyModel {
    fn latency(&self, op: &IoOp) -> Duration {
        let kib = u32::try_from(op.len().div_ceil(1024)).unwrap_or(u32::MAX);
        self.base + self.per_kib.saturating_mul(kib)
    }
}

/// Byte storage shared by every shard's [`MemoryBackend`] for one device.
pub type SharedStorage = Arc<Mutex<Vec<u8>>>;

/// An in-memory device.
///
/// Requests complete after the latency model says they would; the data is
/// read or written at completion time, in completion order.
pub struct MemoryBackend {
    storage: SharedStorage,
    latency: LatencyModel,
    pending: BTreeMap<(Time, RequestId), IoOp>,
    injected: VecDeque<i32>,
    failing: BTreeMap<RequestId, i32>,
}

impl MemoryBackend {
    /// Creates a backend over `storage`.
    #[must_use]
    pub fn new(storage: SharedStorage, latency: LatencyModel) -> Self {
        Self {
            storage,
            latency,
            pending: BTreeMap::new(),
            injected: VecDeque::new(),
            failing: BTreeMap::new(),
        }
    }

    /// Makes the next submitted request fail with OS error `errno`.
    pub fn inject_error(&mut self, errno: i32) {
        self.injected.push_back(errno);
    }

    fn execute(&self, id: RequestId, op: IoOp) -> io::Result<IoCompletion> {
        let mut storage = self.storage.lock();
        match op {
            IoOp::Read { pos, len } => {
                let start = usize::try_from(pos).unwrap_or(usize::MAX).min(storage.len());
                let end = start.saturating_add(len).min(storage.len());
                let data = storage[start..end].to_vec();
                Ok(IoCompletion {
                    id,
                    bytes: data.len(),
                    data,
                })
            }
            IoOp::Write { pos, data } => {
                let start = usize::try_from(pos)
                    .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
                let end = start
                    .checked_add(data.len())
                    .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
                if storage.len() < end {
                    storage.resize(end, 0);
                }
                storage[start..end].copy_from_slice(&data);
                Ok(IoCompletion {
                    id,
                    bytes: data.len(),
                    data: Vec::new(),
                })
            }
            IoOp::Flush => Ok(IoCompletion {
                id,
                bytes: 0,
                data: Vec::new(),
            }),
        }
    }
}

impl IoBackend for MemoryBackend {
    fn submit(&mut self, now: Time, request: BackendRequest) {
        if let Some(errno) = self.injected.pop_front() {
            self.failing.insert(request.id, errno);
        }
        let ready = now + self.latency.latency(&request.op);
        self.pending.insert((ready, request.id), request.op);
    }

    fn poll_completions(&mut self, now: Time, out: &mut Vec<BackendCompletion>) {
        while let Some(entry) = self.pending.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), op) = entry.remove_entry();
            let result = match self.failing.remove(&id) {
                Some(errno) => Err(io::Error::from_raw_os_error(errno)),
                None => self.execute(id, op),
            };
            out.push(BackendCompletion { id, result });
        }
    }

    fn cancel(&mut self, id: RequestId) -> bool {
        let key = self.pending.keys().find(|(_, k)| *k == id).copied();
        match key {
            Some(key) => {
                self.pending.remove(&key);
                self.failing.remove(&id);
                true
            }
            None => false,
        }
    }

    fn in_flight(&self) -> usize {
        self.pending.len()
    }

    fn next_completion(&self) -> Option<Time> {
        self.pending.keys().next().map(|(t, _)| *t)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("latency", &self.latency)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

/// Positional I/O on a regular file.
///
/// Each request runs synchronously at submission; its completion is
/// reported on the next poll.
#[cfg(unix)]
pub struct FileBackend {
    file: std::fs::File,
    done: VecDeque<BackendCompletion>,
}

#[cfg(unix)]
impl FileBackend {
    /// Opens (creating if needed) `path` for reading and writing.
    pub fn open(path: &std::path::Path) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file,
            done: VecDeque::new(),
        })
    }

    fn execute(&self, id: RequestId, op: IoOp) -> io::Result<IoCompletion> {
        use std::os::unix::fs::FileExt;
        match op {
            IoOp::Read { pos, len } => {
                let mut data = vec![0; len];
                let n = self.file.read_at(&mut data, pos)?;
                data.truncate(n);
                Ok(IoCompletion { id, bytes: n, data })
            }
            IoOp::Write { pos, data } => {
                self.file.write_all_at(&data, pos)?;
                Ok(IoCompletion {
                    id,
                    bytes: data.len(),
                    data: Vec::new(),
                })
            }
            IoOp::Flush => {
                self.file.sync_data()?;
                Ok(IoCompletion {
                    id,
                    bytes: 0,
                    data: Vec::new(),
                })
            }
        }
    }
}

#[cfg(unix)]
impl IoBackend for FileBackend {
    fn submit(&mut self, _now: Time, request: BackendRequest) {
        let result = self.execute(request.id, request.op);
        self.done.push_back(BackendCompletion {
            id: request.id,
            result,
        });
    }

    fn poll_completions(&mut self, _now: Time, out: &mut Vec<BackendCompletion>) {
        out.extend(self.done.drain(..));
    }

    fn cancel(&mut self, _id: RequestId) -> bool {
        false
    }

    fn in_flight(&self) -> usize {
        self.done.len()
    }

    fn next_completion(&self) -> Option<Time> {
        (!self.done.is_empty()).then_some(Time::ZERO)
    }

    fn name(&self) -> &str {
        "file"
    }
}

#[cfg(unix)]
impl fmt::Debug for FileBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBackend")
            .field("file", &self.file)
            .field("done", &self.done.len())
            .finish()
    }
}
