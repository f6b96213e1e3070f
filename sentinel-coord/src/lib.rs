//! SENTINEL Coordination - Locks, Idempotency and Dead-Letter Retry
//!
//! Everything in this crate sits on a [`sentinel_storage::CacheBackend`] and
//! relies only on its `put_if_absent` and `compare_and_swap` primitives for
//! atomicity. Contention and ownership outcomes are returned as values
//! ([`AcquireOutcome`], [`ReleaseOutcome`], [`BeginOutcome`]); only
//! unexpected conditions come back as errors.

pub mod dlq;
pub mod idempotency;
pub mod lock;
pub mod wait;

pub use dlq::{
    ArchiveSink, DeadLetterQueue, Dispatcher, DlqSweeper, DlqSweeperMetrics, DlqSweeperSnapshot,
    MemoryArchive, RetryOutcome, SweepReport, TracingArchive,
};
pub use idempotency::{
    BeginOutcome, Execution, IdempotencyCheck, IdempotencyCoordinator, RecordedOutcome,
    RequestMeta,
};
pub use lock::{AcquireOutcome, LockManager, ReleaseOutcome, RenewOutcome};
pub use wait::{PollWait, WaitError};
