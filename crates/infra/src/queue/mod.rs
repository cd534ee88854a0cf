//! Distributed task queue on a key-value store.
//!
//! ## Lifecycle
//!
//! ```text
//! create ──► pending ──acquire──► working ──release──► (gone)
//!               ▲                    │
//!               └──────cleanup───────┘   (heartbeat older than timeout)
//! ```
//!
//! - `pending` is a FIFO list of ids; `working` is a set of ids
//! - every task has an immutable payload record and, once acquired, a
//!   metrics record holding the heartbeat and worker-reported fields
//! - all state transitions are single store transactions; `acquire`,
//!   `release` and `cleanup` are additionally guarded by optimistic watches
//!   and retried on conflict
//!
//! Delivery is at-least-once: a task whose worker stops heartbeating is
//! requeued by `cleanup` and may run again.
//!
//! ## Components
//!
//! - `TaskQueue`: the five queue operations plus inspection reads
//! - `QueueOptions`: retry policies and the corrupt-entry policy
//! - `CleanupReport` / `QueueStats`: operation reports

pub mod task_queue;
pub mod types;

pub use task_queue::{TaskQueue, WorkerIdentity};
pub use types::{CleanupReport, CorruptEntryPolicy, QueueOptions, QueueStats};
