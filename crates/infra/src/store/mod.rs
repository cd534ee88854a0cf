//! Key-value store boundary.
//!
//! The queue is written against a small capability set rather than a concrete
//! product:
//!
//! - **Lists**: push-tail, pop-head, read-at-index, remove-first-occurrence
//! - **Sets**: add, remove, members, membership test
//! - **Hashes**: set fields, get all fields, get one field
//! - **Transactions**: a batch of writes applied atomically, optionally guarded
//!   by an optimistic watch that aborts the batch if a watched key changed
//! - **Clock**: the store server's current time, so workers never compare
//!   their own (possibly skewed) clocks
//!
//! ## Connections
//!
//! Watches are scoped to a connection, so every queue operation opens one
//! connection via [`Store::connect`], performs its reads and its single
//! [`StoreConnection::exec`] on it, and drops it. For Redis that is a TCP
//! connect per call. `cleanup` is the exception: it keeps one connection for
//! the whole pass, since a pass touches every working member and each
//! reclaim ends with either EXEC or UNWATCH.
//!
//! ## Implementations
//!
//! - [`InMemoryStore`]: version-counter watches, manual clock (tests/dev)
//! - `RedisStore` (feature `redis`): WATCH/MULTI/EXEC against a Redis server

use std::collections::BTreeMap;
use std::sync::Arc;

use taskq_core::StoreError;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::{InMemoryConnection, InMemoryStore};
#[cfg(feature = "redis")]
pub use self::redis::{RedisConnection, RedisStore};

/// A single write queued in a [`Transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    PushTail { key: String, value: String },
    PopHead { key: String },
    /// Remove the first occurrence of `value` (scanning from the head).
    ListRemove { key: String, value: String },
    SetAdd { key: String, member: String },
    SetRemove { key: String, member: String },
    HashSet { key: String, fields: Vec<(String, String)> },
    Delete { key: String },
}

impl Command {
    pub fn key(&self) -> &str {
        match self {
            Command::PushTail { key, .. }
            | Command::PopHead { key }
            | Command::ListRemove { key, .. }
            | Command::SetAdd { key, .. }
            | Command::SetRemove { key, .. }
            | Command::HashSet { key, .. }
            | Command::Delete { key } => key,
        }
    }
}

/// An ordered batch of writes committed atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    commands: Vec<Command>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_tail(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.commands.push(Command::PushTail {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn pop_head(&mut self, key: impl Into<String>) -> &mut Self {
        self.commands.push(Command::PopHead { key: key.into() });
        self
    }

    pub fn list_remove(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.commands.push(Command::ListRemove {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn set_add(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.commands.push(Command::SetAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn set_remove(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.commands.push(Command::SetRemove {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    /// Set hash fields. An empty field list queues nothing.
    pub fn hash_set<I, K, V>(&mut self, key: impl Into<String>, fields: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let fields: Vec<(String, String)> = fields
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        if !fields.is_empty() {
            self.commands.push(Command::HashSet {
                key: key.into(),
                fields,
            });
        }
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.commands.push(Command::Delete { key: key.into() });
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// One connection to the store. Not shared between threads.
pub trait StoreConnection {
    /// Start watching `keys`; a later [`exec`](Self::exec) fails with
    /// [`StoreError::Conflict`] if any of them is modified in between.
    fn watch(&mut self, keys: &[&str]) -> Result<(), StoreError>;

    /// Drop all watches without executing anything.
    fn unwatch(&mut self) -> Result<(), StoreError>;

    /// Server clock, whole seconds since the Unix epoch.
    fn server_time(&mut self) -> Result<i64, StoreError>;

    fn list_index(&mut self, key: &str, index: isize) -> Result<Option<String>, StoreError>;

    fn list_len(&mut self, key: &str) -> Result<usize, StoreError>;

    /// Inclusive range; negative indices count from the tail.
    fn list_range(&mut self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError>;

    fn set_members(&mut self, key: &str) -> Result<Vec<String>, StoreError>;

    fn set_contains(&mut self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// All fields of a hash; empty when the key does not exist.
    fn hash_get_all(&mut self, key: &str) -> Result<BTreeMap<String, String>, StoreError>;

    fn hash_get(&mut self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// Apply `tx` atomically and clear any watches.
    ///
    /// Returns [`StoreError::Conflict`] (and applies nothing) if a watched key
    /// changed since [`watch`](Self::watch).
    fn exec(&mut self, tx: &Transaction) -> Result<(), StoreError>;
}

/// A store client handed to each queue at construction.
pub trait Store: Send + Sync {
    type Connection: StoreConnection;

    fn connect(&self) -> Result<Self::Connection, StoreError>;
}

impl<S> Store for Arc<S>
where
    S: Store + ?Sized,
{
    type Connection = S::Connection;

    fn connect(&self) -> Result<Self::Connection, StoreError> {
        (**self).connect()
    }
}
