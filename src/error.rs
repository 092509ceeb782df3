//! Error types and error handling strategy.
//!
//! Every failure that can reach a future is an [`Error`]. Errors travel
//! through the continuation graph like values: a continuation that does not
//! handle errors passes them on unchanged.
//!
//! # Error Categories
//!
//! - **Promise**: the producer went away without resolving (broken promise)
//! - **Deadline**: a wait elapsed its deadline
//! - **Cancellation**: an explicit abort request resolved a pending wait
//! - **Admission**: an I/O queue rejected a request before dispatch
//! - **Io**: an error reported by the I/O backend, passed through unchanged
//! - **Lifecycle**: gates, broken primitives and shutting-down shards
//! - **Scheduling**: scheduling-group and I/O-class registry misuse
//! - **Config**: invalid runtime configuration
//! - **Internal**: runtime bugs, captured panics and deadlocks
//!
//! Stall detection is not an error: stalls are reported out-of-band by the
//! reactor and never delivered to a future.
//!
//! # Recovery Classification
//!
//! All errors can be classified by [`Recoverability`]:
//! - `Transient`: Temporary failure, safe to retry (queue full)
//! - `Permanent`: Unrecoverable, do not retry
//! - `Unknown`: Recoverability depends on context

use core::fmt;
use std::sync::Arc;

use crate::types::{ClassId, GroupId, RequestId, ShardId};

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Promise ===
    /// The promise was destroyed before a value or error was set.
    BrokenPromise,

    // === Deadline ===
    /// A deadline elapsed before the wait was satisfied.
    Timeout,

    // === Cancellation ===
    /// The wait was aborted through an abort source.
    Aborted,

    // === Admission ===
    /// The I/O queue is at its configured depth limit.
    QueueFull,

    // === Io ===
    /// The I/O backend reported a failure.
    Io,

    // === Lifecycle ===
    /// The gate is closed and no longer admits new operations.
    GateClosed,
    /// The primitive (semaphore, condition variable) was broken.
    Broken,
    /// The destination shard is shutting down.
    ShardShutdown,

    // === Scheduling ===
    /// Unknown scheduling group, or an operation not allowed on it.
    InvalidGroup,
    /// The scheduling group still has queued tasks.
    GroupBusy,
    /// Unknown I/O priority class.
    InvalidClass,

    // === Config ===
    /// Configuration value could not be parsed or is out of range.
    Config,

    // === Internal ===
    /// A continuation or task panicked.
    Panicked,
    /// The reactor has nothing left to run but the awaited future is pending.
    Deadlock,
    /// Misuse of an API detected at runtime.
    InvalidState,
    /// Internal runtime error (bug).
    Internal,

    // === User ===
    /// User-provided error.
    User,
}

impl ErrorKind {
    /// Returns the error category for this kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::BrokenPromise => ErrorCategory::Promise,
            Self::Timeout => ErrorCategory::Deadline,
            Self::Aborted => ErrorCategory::Cancellation,
            Self::QueueFull => ErrorCategory::Admission,
            Self::Io => ErrorCategory::Io,
            Self::GateClosed | Self::Broken | Self::ShardShutdown => ErrorCategory::Lifecycle,
            Self::InvalidGroup | Self::GroupBusy | Self::InvalidClass => ErrorCategory::Scheduling,
            Self::Config => ErrorCategory::Config,
            Self::Panicked | Self::Deadlock | Self::InvalidState | Self::Internal => {
                ErrorCategory::Internal
            }
            Self::User => ErrorCategory::User,
        }
    }

    /// Returns the recoverability classification for this error kind.
    #[must_use]
    pub const fn recoverability(&self) -> Recoverability {
        match self {
            Self::QueueFull | Self::GroupBusy => Recoverability::Transient,

            Self::BrokenPromise
            | Self::Aborted
            | Self::GateClosed
            | Self::Broken
            | Self::ShardShutdown
            | Self::InvalidGroup
            | Self::InvalidClass
            | Self::Config
            | Self::Panicked
            | Self::Deadlock
            | Self::InvalidState
            | Self::Internal => Recoverability::Permanent,

            Self::Timeout | Self::Io | Self::User => Recoverability::Unknown,
        }
    }

    /// Returns true if this error is typically retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.recoverability(), Recoverability::Transient)
    }
}

/// Classification of error recoverability for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recoverability {
    /// Temporary failure that may succeed on retry.
    Transient,
    /// Permanent failure that will not succeed on retry.
    Permanent,
    /// Recoverability depends on context and cannot be determined
    /// from the error kind alone.
    Unknown,
}

impl Recoverability {
    /// Returns true if this error is safe to retry.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// High-level error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Producer-side failures.
    Promise,
    /// Deadline expiry.
    Deadline,
    /// Explicit cancellation.
    Cancellation,
    /// Admission control rejections (backpressure).
    Admission,
    /// Backend I/O failures.
    Io,
    /// Primitive and shard lifecycle failures.
    Lifecycle,
    /// Scheduling-group and I/O-class registry failures.
    Scheduling,
    /// Configuration failures.
    Config,
    /// Internal runtime errors.
    Internal,
    /// User-originated errors.
    User,
}

/// Diagnostic context for an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// Shard where the error originated.
    pub shard: Option<ShardId>,
    /// Scheduling group involved.
    pub group: Option<GroupId>,
    /// I/O priority class involved.
    pub class: Option<ClassId>,
    /// I/O request involved.
    pub request: Option<RequestId>,
}

/// The main error type for runtime operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    context: ErrorContext,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
            context: ErrorContext {
                shard: None,
                group: None,
                class: None,
                request: None,
            },
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds structured context to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: ErrorContext) -> Self {
        self.context = ctx;
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns the recoverability classification.
    #[must_use]
    pub const fn recoverability(&self) -> Recoverability {
        self.kind.recoverability()
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns the error context.
    #[must_use]
    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Returns true for a broken promise.
    #[must_use]
    pub const fn is_broken_promise(&self) -> bool {
        matches!(self.kind, ErrorKind::BrokenPromise)
    }

    /// Returns true if a deadline elapsed.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }

    /// Returns true if the wait was aborted.
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(self.kind, ErrorKind::Aborted)
    }

    /// Returns true if admission control rejected the request.
    #[must_use]
    pub const fn is_queue_full(&self) -> bool {
        matches!(self.kind, ErrorKind::QueueFull)
    }

    /// Returns the OS error code of a backend I/O failure, if any.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        self.source
            .as_deref()
            .and_then(|source| source.downcast_ref::<std::io::Error>())
            .and_then(std::io::Error::raw_os_error)
    }

    /// Creates a broken-promise error.
    #[must_use]
    pub fn broken_promise() -> Self {
        Self::new(ErrorKind::BrokenPromise).with_message("promise dropped without a result")
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout).with_message(what)
    }

    /// Creates an aborted error.
    #[must_use]
    pub fn aborted(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::Aborted).with_message(what)
    }

    /// Creates a queue-full error.
    #[must_use]
    pub fn queue_full(queued: usize, limit: usize) -> Self {
        Self::new(ErrorKind::QueueFull)
            .with_message(format!("{queued} requests queued, limit {limit}"))
    }

    /// Wraps a backend I/O error without altering it.
    #[must_use]
    pub fn io(err: std::io::Error) -> Self {
        let message = err.to_string();
        Self::new(ErrorKind::Io)
            .with_message(message)
            .with_source(err)
    }

    /// Creates a user error with a message.
    #[must_use]
    pub fn user(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::User).with_message(msg)
    }

    /// Creates an invalid-state error for detected API misuse.
    #[must_use]
    pub fn invalid_state(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState).with_message(detail)
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config).with_message(detail)
    }

    /// Creates an error from a captured panic payload.
    #[must_use]
    pub fn panicked(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::new(ErrorKind::Panicked).with_message(message)
    }

    /// Creates an internal error (runtime bug).
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_message(detail)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::io(err)
    }
}

/// Extension trait for adding context to Results.
#[allow(clippy::result_large_err)]
pub trait ResultExt<T> {
    /// Attach a context message on error.
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_message(msg))
    }
}

/// A specialized Result type for runtime operations.
#[allow(clippy::result_large_err)]
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug)]
    struct Underlying;

    impl fmt::Display for Underlying {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "underlying")
        }
    }

    impl std::error::Error for Underlying {}

    #[test]
    fn display_without_message() {
        let err = Error::new(ErrorKind::Internal);
        assert_eq!(err.to_string(), "Internal");
    }

    #[test]
    fn display_with_message() {
        let err = Error::new(ErrorKind::QueueFull).with_message("disk busy");
        assert_eq!(err.to_string(), "QueueFull: disk busy");
    }

    #[test]
    fn source_chain_is_exposed() {
        let err = Error::new(ErrorKind::User)
            .with_message("outer")
            .with_source(Underlying);
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "underlying");
    }

    #[test]
    fn io_errors_keep_os_code() {
        let err = Error::io(std::io::Error::from_raw_os_error(5));
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.raw_os_error(), Some(5));
    }

    #[test]
    fn result_ext_adds_message() {
        let res: core::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        let err = res.context("read failed").expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.to_string(), "Io: read failed");
    }

    #[test]
    fn classification() {
        assert!(ErrorKind::QueueFull.is_retryable());
        assert!(!ErrorKind::BrokenPromise.is_retryable());
        assert_eq!(ErrorKind::Aborted.category(), ErrorCategory::Cancellation);
        assert_eq!(ErrorKind::Deadlock.category(), ErrorCategory::Internal);
        assert!(Error::timeout("wait").is_timeout());
        assert!(Error::broken_promise().is_broken_promise());
    }

    #[test]
    fn panic_payload_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("kaboom");
        let err = Error::panicked(payload.as_ref());
        assert_eq!(err.kind(), ErrorKind::Panicked);
        assert_eq!(err.message(), Some("kaboom"));

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(Error::panicked(payload.as_ref()).message(), Some("owned"));
    }

    #[test]
    fn context_round_trip() {
        let ctx = ErrorContext {
            shard: Some(ShardId::new(1)),
            group: Some(GroupId::DEFAULT),
            class: None,
            request: None,
        };
        let err = Error::new(ErrorKind::GroupBusy).with_context(ctx);
        assert_eq!(err.context().shard, Some(ShardId::new(1)));
        assert!(err.context().class.is_none());
    }
}
