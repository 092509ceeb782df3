//! Shard-local synchronization built on the continuation graph.
//!
//! None of these primitives block a thread. A wait returns a [`Future`]
//! that resolves once the condition holds, and every primitive lives on
//! one shard; cross-shard coordination goes through
//! [`smp`](crate::smp) messages.
//!
//! # Primitives
//!
//! - [`Gate`]: tracks operations in flight, so shutdown can wait for them
//! - [`Semaphore`]: counting semaphore with strictly FIFO waiters
//! - [`ConditionVariable`]: wake one or all waiting continuations
//! - [`AbortSource`]: cooperative cancellation of pending waits
//! - [`ExpiringFifo`], [`AbortableFifo`]: waiter queues whose entries may
//!   leave early
//!
//! # Early exit
//!
//! Waits that take a deadline fail with
//! [`Timeout`](crate::ErrorKind::Timeout) when it passes; waits that take
//! an [`AbortSource`] fail with [`Aborted`](crate::ErrorKind::Aborted) once
//! it fires. Either way the waiter leaves its queue and the waiters behind
//! it keep their order.
//!
//! [`Future`]: crate::future::Future

pub mod abort;
pub mod abortable_fifo;
pub mod condvar;
pub mod expiring_fifo;
pub mod gate;
pub mod semaphore;

pub use abort::{AbortSource, AbortSubscription};
pub use abortable_fifo::AbortableFifo;
pub use condvar::ConditionVariable;
pub use expiring_fifo::{EntryId, ExpiringFifo, Expiry};
pub use gate::{with_gate, Gate, GateHolder};
pub use semaphore::{with_semaphore, Semaphore, SemaphoreUnits};
