//! Infrastructure layer: stores, the task queue, retry, config, workers.

pub mod config;
pub mod queue;
pub mod retry;
pub mod store;
pub mod workers;


pub use config::{ConfigError, StoreConfig};
pub use queue::{CleanupReport, CorruptEntryPolicy, QueueOptions, QueueStats, TaskQueue, WorkerIdentity};
pub use retry::{RetryOn, RetryPolicy};
pub use store::{InMemoryStore, Store, StoreConnection, Transaction};
#[cfg(feature = "redis")]
pub use store::RedisStore;
