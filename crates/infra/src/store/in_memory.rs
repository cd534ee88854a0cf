//! In-memory store for tests/dev.
//!
//! - No IO
//! - Watches are version counters: every effective write bumps the key's
//!   version, and `exec` aborts if a watched version moved
//! - The clock only moves when told to, so staleness is deterministic
//! - Connection failures can be injected to exercise retry paths

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use taskq_core::StoreError;

use super::{Command, Store, StoreConnection, Transaction};

#[derive(Debug, Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, HashSet<String>>,
    hashes: HashMap<String, BTreeMap<String, String>>,
    versions: HashMap<String, u64>,
}

impl State {
    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn touch(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_insert(0) += 1;
    }

    fn apply(&mut self, command: &Command) {
        let changed = match command {
            Command::PushTail { key, value } => {
                self.lists.entry(key.clone()).or_default().push_back(value.clone());
                true
            }
            Command::PopHead { key } => {
                let popped = self.lists.get_mut(key).and_then(VecDeque::pop_front).is_some();
                self.drop_empty_list(key);
                popped
            }
            Command::ListRemove { key, value } => {
                let removed = match self.lists.get_mut(key) {
                    Some(list) => match list.iter().position(|v| v == value) {
                        Some(pos) => list.remove(pos).is_some(),
                        None => false,
                    },
                    None => false,
                };
                self.drop_empty_list(key);
                removed
            }
            Command::SetAdd { key, member } => {
                self.sets.entry(key.clone()).or_default().insert(member.clone())
            }
            Command::SetRemove { key, member } => {
                let removed = self.sets.get_mut(key).is_some_and(|s| s.remove(member));
                if self.sets.get(key).is_some_and(HashSet::is_empty) {
                    self.sets.remove(key);
                }
                removed
            }
            Command::HashSet { key, fields } => {
                let hash = self.hashes.entry(key.clone()).or_default();
                for (field, value) in fields {
                    hash.insert(field.clone(), value.clone());
                }
                !fields.is_empty()
            }
            Command::Delete { key } => {
                let a = self.lists.remove(key).is_some();
                let b = self.sets.remove(key).is_some();
                let c = self.hashes.remove(key).is_some();
                a || b || c
            }
        };

        if changed {
            self.touch(command.key());
        }
    }

    fn drop_empty_list(&mut self, key: &str) {
        if self.lists.get(key).is_some_and(VecDeque::is_empty) {
            self.lists.remove(key);
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    clock: AtomicI64,
    failing_connects: AtomicU32,
    connections_opened: AtomicU64,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::command("in-memory store lock poisoned"))
    }
}

/// In-memory store. Clones share the same data.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl InMemoryStore {
    /// New empty store whose clock starts at the current wall-clock second.
    pub fn new() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self::with_clock(now)
    }

    /// New empty store whose clock starts at `epoch_secs`.
    pub fn with_clock(epoch_secs: i64) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                clock: AtomicI64::new(epoch_secs),
                failing_connects: AtomicU32::new(0),
                connections_opened: AtomicU64::new(0),
            }),
        }
    }

    /// Current server time.
    pub fn now(&self) -> i64 {
        self.shared.clock.load(Ordering::SeqCst)
    }

    /// Move the server clock forward.
    pub fn advance(&self, by: Duration) {
        self.shared
            .clock
            .fetch_add(by.as_secs() as i64, Ordering::SeqCst);
    }

    /// Make the next `n` calls to [`Store::connect`] fail with a connection error.
    pub fn fail_next_connects(&self, n: u32) {
        self.shared.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Number of successful [`Store::connect`] calls so far.
    pub fn connections_opened(&self) -> u64 {
        self.shared.connections_opened.load(Ordering::SeqCst)
    }

    /// Apply writes directly, bypassing watches (fixtures and fault injection).
    pub fn apply(&self, tx: &Transaction) -> Result<(), StoreError> {
        let mut state = self.shared.lock()?;
        for command in tx.commands() {
            state.apply(command);
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for InMemoryStore {
    type Connection = InMemoryConnection;

    fn connect(&self) -> Result<Self::Connection, StoreError> {
        let injected = self
            .shared
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::connection("injected connection failure"));
        }

        self.shared.connections_opened.fetch_add(1, Ordering::SeqCst);
        Ok(InMemoryConnection {
            shared: self.shared.clone(),
            watched: Vec::new(),
        })
    }
}

/// Connection to an [`InMemoryStore`]; carries its own watch list.
#[derive(Debug)]
pub struct InMemoryConnection {
    shared: Arc<Shared>,
    watched: Vec<(String, u64)>,
}

impl StoreConnection for InMemoryConnection {
    fn watch(&mut self, keys: &[&str]) -> Result<(), StoreError> {
        let state = self.shared.lock()?;
        for key in keys {
            self.watched.push((key.to_string(), state.version(key)));
        }
        Ok(())
    }

    fn unwatch(&mut self) -> Result<(), StoreError> {
        self.watched.clear();
        Ok(())
    }

    fn server_time(&mut self) -> Result<i64, StoreError> {
        Ok(self.shared.clock.load(Ordering::SeqCst))
    }

    fn list_index(&mut self, key: &str, index: isize) -> Result<Option<String>, StoreError> {
        let state = self.shared.lock()?;
        let Some(list) = state.lists.get(key) else {
            return Ok(None);
        };
        let pos = if index < 0 {
            list.len().checked_sub(index.unsigned_abs())
        } else {
            Some(index as usize)
        };
        Ok(pos.and_then(|p| list.get(p)).cloned())
    }

    fn list_len(&mut self, key: &str) -> Result<usize, StoreError> {
        let state = self.shared.lock()?;
        Ok(state.lists.get(key).map_or(0, VecDeque::len))
    }

    fn list_range(&mut self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError> {
        let state = self.shared.lock()?;
        let Some(list) = state.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as isize;
        let norm = |i: isize| if i < 0 { len + i } else { i };
        // Same clamping as LRANGE: a start before the head is the head, a stop
        // before the head selects nothing.
        let (start, stop) = (norm(start).max(0), norm(stop).min(len - 1));
        if stop < 0 || start > stop {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    fn set_members(&mut self, key: &str) -> Result<Vec<String>, StoreError> {
        let state = self.shared.lock()?;
        Ok(state
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn set_contains(&mut self, key: &str, member: &str) -> Result<bool, StoreError> {
        let state = self.shared.lock()?;
        Ok(state.sets.get(key).is_some_and(|s| s.contains(member)))
    }

    fn hash_get_all(&mut self, key: &str) -> Result<BTreeMap<String, String>, StoreError> {
        let state = self.shared.lock()?;
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    fn hash_get(&mut self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let state = self.shared.lock()?;
        Ok(state.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    fn exec(&mut self, tx: &Transaction) -> Result<(), StoreError> {
        let watched = std::mem::take(&mut self.watched);
        let mut state = self.shared.lock()?;

        if watched.iter().any(|(key, version)| state.version(key) != *version) {
            return Err(StoreError::Conflict);
        }

        for command in tx.commands() {
            state.apply(command);
        }
        Ok(())
    }
}
