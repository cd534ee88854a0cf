//! `taskq-core`: queue building blocks shared by every store backend.
//!
//! This crate contains **pure** primitives (no IO): task identifiers, the
//! per-topic key schema, record types and the error model.

pub mod error;
pub mod id;
pub mod keys;
pub mod record;

pub use error::{QueueError, QueueResult, StoreError};
pub use id::TaskId;
pub use keys::{KeySchema, Topic};
pub use record::{MetricsRecord, Payload, fields};
