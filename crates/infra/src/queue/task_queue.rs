//! The task queue: create / acquire / update / release / cleanup.

use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use taskq_core::{
    KeySchema, MetricsRecord, Payload, QueueError, QueueResult, TaskId, Topic, fields,
};

use super::types::{CleanupReport, CorruptEntryPolicy, QueueOptions, QueueStats};
use crate::store::{Store, StoreConnection, Transaction};

/// Host and process recorded in the metrics of every task this queue acquires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub hostname: String,
    pub pid: u32,
}

impl WorkerIdentity {
    /// Identity of the current process.
    pub fn current() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            hostname,
            pid: std::process::id(),
        }
    }
}

/// A queue bound to one topic of one store.
///
/// Each operation opens its own store connection, so a `TaskQueue` can be
/// shared by reference across threads (the consumer's heartbeat thread does
/// exactly that).
#[derive(Debug, Clone)]
pub struct TaskQueue<S> {
    store: S,
    keys: KeySchema,
    options: QueueOptions,
    identity: WorkerIdentity,
}

/// Head-of-queue scan result.
enum Candidate {
    /// Nothing acquirable right now.
    Nothing,
    /// An entry with a payload at position `index`.
    Ready {
        index: usize,
        id: TaskId,
        payload: Payload,
    },
    /// A corrupt entry at position `index` to move to the quarantine list.
    Quarantine { index: usize, raw: String },
}

/// Per-member cleanup result.
enum Reclaim {
    Requeued { elapsed: Option<i64> },
    Fresh,
    Gone,
}

impl<S: Store> TaskQueue<S> {
    pub fn new(store: S, topic: Topic) -> Self {
        Self::with_options(store, topic, QueueOptions::default())
    }

    pub fn with_options(store: S, topic: Topic, options: QueueOptions) -> Self {
        Self {
            store,
            keys: KeySchema::new(topic),
            options,
            identity: WorkerIdentity::current(),
        }
    }

    /// Override the host/process recorded on acquisition.
    pub fn with_identity(mut self, identity: WorkerIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn topic(&self) -> &Topic {
        self.keys.topic()
    }

    pub fn keys(&self) -> &KeySchema {
        &self.keys
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Enqueue a new task and return its id.
    ///
    /// The payload record and the pending-list append are committed in one
    /// transaction. A retried attempt uses a fresh id, so a commit whose reply
    /// was lost never leaves the same id in the list twice.
    #[instrument(skip(self, payload), fields(topic = %self.keys.topic()), err)]
    pub fn create(&self, payload: &Payload) -> QueueResult<TaskId> {
        if payload.is_empty() {
            return Err(QueueError::invalid_payload(
                "payload must contain at least one field",
            ));
        }

        let id = self.options.connection_retry.run("create", || {
            let id = TaskId::generate();
            let mut conn = self.store.connect()?;

            let mut tx = Transaction::new();
            tx.hash_set(self.keys.listing(&id), payload.clone())
                .push_tail(self.keys.pending(), id.as_str());
            conn.exec(&tx)?;

            Ok(id)
        })?;

        info!(topic = %self.keys.topic(), task_id = %id, "created task");
        Ok(id)
    }

    /// Claim the next pending task.
    ///
    /// Returns `None` when nothing is pending. The claim (pop from pending, add
    /// to working, fresh metrics record) commits only if the pending list did
    /// not change since it was read; a lost race retries from the head.
    #[instrument(skip(self), fields(topic = %self.keys.topic()), err)]
    pub fn acquire(&self) -> QueueResult<Option<(TaskId, Payload)>> {
        let acquired = self
            .options
            .conflict_retry
            .run("acquire", || self.try_acquire())?;

        match &acquired {
            Some((id, _)) => info!(topic = %self.keys.topic(), task_id = %id, "acquired task"),
            None => debug!(topic = %self.keys.topic(), "no pending tasks"),
        }
        Ok(acquired)
    }

    fn try_acquire(&self) -> QueueResult<Option<(TaskId, Payload)>> {
        let mut conn = self.store.connect()?;
        let pending = self.keys.pending();

        loop {
            conn.watch(&[pending])?;

            match self.find_candidate(&mut conn)? {
                Candidate::Nothing => {
                    conn.unwatch()?;
                    return Ok(None);
                }
                Candidate::Quarantine { index, raw } => {
                    let mut tx = Transaction::new();
                    remove_at(&mut tx, pending, index, &raw);
                    tx.push_tail(self.keys.quarantine(), raw.as_str());
                    conn.exec(&tx)?;

                    warn!(
                        topic = %self.keys.topic(),
                        task_id = %raw,
                        quarantine = %self.keys.quarantine(),
                        "moved pending task without payload to quarantine"
                    );
                }
                Candidate::Ready { index, id, payload } => {
                    let now = conn.server_time()?.to_string();
                    let metrics = self.keys.metrics(&id);

                    let mut tx = Transaction::new();
                    remove_at(&mut tx, pending, index, id.as_str());
                    tx.set_add(self.keys.working(), id.as_str())
                        .delete(metrics.as_str())
                        .hash_set(
                            metrics.as_str(),
                            [
                                (fields::HEARTBEAT, now.clone()),
                                (fields::LAST_ACQUIRED, now),
                                (fields::HOSTNAME, self.identity.hostname.clone()),
                                (fields::PID, self.identity.pid.to_string()),
                            ],
                        );
                    conn.exec(&tx)?;

                    return Ok(Some((id, payload)));
                }
            }
        }
    }

    /// Walk the pending list from the head until an entry with a payload is
    /// found, applying the corrupt-entry policy to entries without one.
    fn find_candidate(&self, conn: &mut S::Connection) -> QueueResult<Candidate> {
        let pending = self.keys.pending();
        let max_scan = match self.options.corrupt_entry_policy {
            CorruptEntryPolicy::Skip { max_scan } => max_scan.max(1),
            CorruptEntryPolicy::Quarantine | CorruptEntryPolicy::Stall => 1,
        };

        for index in 0..max_scan {
            let Some(raw) = conn.list_index(pending, index as isize)? else {
                return Ok(Candidate::Nothing);
            };

            if let Ok(id) = raw.parse::<TaskId>() {
                let payload = conn.hash_get_all(&self.keys.listing(&id))?;
                if !payload.is_empty() {
                    return Ok(Candidate::Ready { index, id, payload });
                }
            }

            error!(
                topic = %self.keys.topic(),
                task_id = %raw,
                position = index,
                "pending task has no payload record"
            );

            match self.options.corrupt_entry_policy {
                CorruptEntryPolicy::Skip { .. } => continue,
                CorruptEntryPolicy::Quarantine => return Ok(Candidate::Quarantine { index, raw }),
                CorruptEntryPolicy::Stall => return Ok(Candidate::Nothing),
            }
        }

        warn!(
            topic = %self.keys.topic(),
            max_scan,
            "no acquirable task within scan depth"
        );
        Ok(Candidate::Nothing)
    }

    /// Refresh the heartbeat and merge `fields` into the task's metrics.
    ///
    /// Precondition: the task is currently working and owned by the caller.
    /// This is not checked; updating a task that is not working writes a
    /// metrics record nobody will clean up until the task is released.
    #[instrument(skip(self, id, metrics), fields(topic = %self.keys.topic(), task_id = %id), err)]
    pub fn update<I, K, V>(&self, id: &TaskId, metrics: I) -> QueueResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        let metrics: Vec<(String, String)> = metrics
            .into_iter()
            .map(|(k, v)| (k.into(), v.to_string()))
            .collect();
        let key = self.keys.metrics(id);

        self.options.connection_retry.run("update", || {
            let mut conn = self.store.connect()?;
            let now = conn.server_time()?;

            // Heartbeat last so the server time wins over a caller field of the same name.
            let mut tx = Transaction::new();
            tx.hash_set(key.as_str(), metrics.iter().cloned())
                .hash_set(key.as_str(), [(fields::HEARTBEAT, now.to_string())]);
            conn.exec(&tx)?;
            Ok(())
        })?;

        debug!(topic = %self.keys.topic(), task_id = %id, fields = metrics.len(), "updated task metrics");
        Ok(())
    }

    /// Refresh the heartbeat only.
    pub fn heartbeat(&self, id: &TaskId) -> QueueResult<()> {
        self.update(id, std::iter::empty::<(String, String)>())
    }

    /// Finish a task: drop it from the working set and delete its payload and
    /// metrics records.
    ///
    /// Idempotent: returns `Ok(false)` without touching anything when the id is
    /// not in the working set (already released, or requeued by cleanup).
    #[instrument(skip(self, id), fields(topic = %self.keys.topic(), task_id = %id), err)]
    pub fn release(&self, id: &TaskId) -> QueueResult<bool> {
        let working = self.keys.working();

        let released = self.options.conflict_retry.run("release", || {
            let mut conn = self.store.connect()?;
            conn.watch(&[working])?;

            if !conn.set_contains(working, id.as_str())? {
                conn.unwatch()?;
                return Ok(false);
            }

            let mut tx = Transaction::new();
            tx.set_remove(working, id.as_str())
                .delete(self.keys.listing(id))
                .delete(self.keys.metrics(id));
            conn.exec(&tx)?;
            Ok(true)
        })?;

        if released {
            info!(topic = %self.keys.topic(), task_id = %id, "released task");
        } else {
            warn!(
                topic = %self.keys.topic(),
                task_id = %id,
                "task is not in the working set; release ignored"
            );
        }
        Ok(released)
    }

    /// Move working tasks whose heartbeat is older than `timeout` back to the
    /// pending tail.
    ///
    /// Each member is reclaimed in its own transaction watching the working
    /// set and the member's metrics, so a concurrent cleanup, release or
    /// heartbeat aborts it; the retry then re-checks membership, which is what
    /// keeps two concurrent cleanups from requeueing the same id twice. A
    /// member with a missing or unreadable heartbeat counts as stale.
    ///
    /// The snapshot and all reclaims share one connection.
    #[instrument(skip(self, timeout), fields(topic = %self.keys.topic(), timeout_secs = timeout.as_secs()), err)]
    pub fn cleanup(&self, timeout: Duration) -> QueueResult<CleanupReport> {
        // One connection serves the whole pass; it is reopened only after a failure.
        let mut conn = None;

        let members = self.options.connection_retry.run("cleanup.snapshot", || {
            self.on_connection(&mut conn, |c| Ok(c.set_members(self.keys.working())?))
        })?;

        let timeout_secs = i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX);
        let mut report = CleanupReport::default();

        for raw in members {
            report.inspected += 1;

            let id = match raw.parse::<TaskId>() {
                Ok(id) => id,
                Err(e) => {
                    error!(topic = %self.keys.topic(), task_id = %raw, error = %e, "malformed id in working set");
                    report.skipped += 1;
                    continue;
                }
            };

            let outcome = self
                .options
                .conflict_retry
                .run("cleanup", || {
                    self.on_connection(&mut conn, |c| self.try_reclaim(c, &id, timeout_secs))
                })?;

            match outcome {
                Reclaim::Requeued { elapsed } => {
                    match elapsed {
                        Some(secs) => warn!(
                            topic = %self.keys.topic(),
                            task_id = %id,
                            stale_secs = secs,
                            "requeued stale task"
                        ),
                        None => warn!(
                            topic = %self.keys.topic(),
                            task_id = %id,
                            "requeued working task without a readable heartbeat"
                        ),
                    }
                    report.requeued.push(id);
                }
                Reclaim::Fresh => report.fresh += 1,
                Reclaim::Gone => report.skipped += 1,
            }
        }

        debug!(
            topic = %self.keys.topic(),
            inspected = report.inspected,
            requeued = report.requeued.len(),
            "cleanup finished"
        );
        Ok(report)
    }

    /// Run `op` on the connection held in `slot`, opening one when empty.
    ///
    /// Any failure other than a watch conflict drops the connection, since its
    /// watch state is then unknown; the next attempt reconnects.
    fn on_connection<T, F>(&self, slot: &mut Option<S::Connection>, op: F) -> QueueResult<T>
    where
        F: FnOnce(&mut S::Connection) -> QueueResult<T>,
    {
        let conn = match slot {
            Some(conn) => conn,
            None => slot.insert(self.store.connect()?),
        };

        let result = op(conn);
        if result.as_ref().is_err_and(|e| !e.is_conflict()) {
            *slot = None;
        }
        result
    }

    /// Check one working member and requeue it if stale. Leaves no watch
    /// behind on `conn` whatever the outcome.
    fn try_reclaim(
        &self,
        conn: &mut S::Connection,
        id: &TaskId,
        timeout_secs: i64,
    ) -> QueueResult<Reclaim> {
        let working = self.keys.working();
        let metrics = self.keys.metrics(id);

        conn.watch(&[working, metrics.as_str()])?;

        if !conn.set_contains(working, id.as_str())? {
            conn.unwatch()?;
            return Ok(Reclaim::Gone);
        }

        let now = conn.server_time()?;
        let heartbeat = conn
            .hash_get(&metrics, fields::HEARTBEAT)?
            .and_then(|v| v.parse::<i64>().ok());
        let elapsed = heartbeat.map(|hb| now - hb);

        if elapsed.is_some_and(|secs| secs <= timeout_secs) {
            conn.unwatch()?;
            return Ok(Reclaim::Fresh);
        }

        let mut tx = Transaction::new();
        tx.set_remove(working, id.as_str())
            .push_tail(self.keys.pending(), id.as_str());
        conn.exec(&tx)?;

        Ok(Reclaim::Requeued { elapsed })
    }

    /// Pending ids, head first.
    pub fn pending_ids(&self) -> QueueResult<Vec<String>> {
        self.options.connection_retry.run("pending_ids", || {
            let mut conn = self.store.connect()?;
            Ok(conn.list_range(self.keys.pending(), 0, -1)?)
        })
    }

    /// Working ids, sorted.
    pub fn working_ids(&self) -> QueueResult<Vec<String>> {
        let mut ids = self.options.connection_retry.run("working_ids", || {
            let mut conn = self.store.connect()?;
            Ok(conn.set_members(self.keys.working())?)
        })?;
        ids.sort();
        Ok(ids)
    }

    /// Ids moved aside by [`CorruptEntryPolicy::Quarantine`], oldest first.
    pub fn quarantined_ids(&self) -> QueueResult<Vec<String>> {
        self.options.connection_retry.run("quarantined_ids", || {
            let mut conn = self.store.connect()?;
            Ok(conn.list_range(self.keys.quarantine(), 0, -1)?)
        })
    }

    pub fn is_working(&self, id: &TaskId) -> QueueResult<bool> {
        self.options.connection_retry.run("is_working", || {
            let mut conn = self.store.connect()?;
            Ok(conn.set_contains(self.keys.working(), id.as_str())?)
        })
    }

    /// Payload record of a task, `None` once released.
    pub fn payload(&self, id: &TaskId) -> QueueResult<Option<Payload>> {
        let payload = self.options.connection_retry.run("payload", || {
            let mut conn = self.store.connect()?;
            Ok(conn.hash_get_all(&self.keys.listing(id))?)
        })?;
        Ok((!payload.is_empty()).then_some(payload))
    }

    /// Metrics record of a task, `None` before first acquisition or once released.
    pub fn metrics(&self, id: &TaskId) -> QueueResult<Option<MetricsRecord>> {
        let metrics = self.options.connection_retry.run("metrics", || {
            let mut conn = self.store.connect()?;
            Ok(conn.hash_get_all(&self.keys.metrics(id))?)
        })?;
        Ok((!metrics.is_empty()).then(|| MetricsRecord::new(metrics)))
    }

    /// Counts plus the sum of each of `fields` across working tasks.
    pub fn stats(&self, fields: &[&str]) -> QueueResult<QueueStats> {
        self.options.connection_retry.run("stats", || {
            let mut conn = self.store.connect()?;
            let pending = conn.list_len(self.keys.pending())?;
            let working = conn.set_members(self.keys.working())?;

            let mut totals: std::collections::BTreeMap<String, f64> =
                fields.iter().map(|f| (f.to_string(), 0.0)).collect();

            for raw in &working {
                let Ok(id) = raw.parse::<TaskId>() else {
                    continue;
                };
                let record = MetricsRecord::new(conn.hash_get_all(&self.keys.metrics(&id))?);
                for (field, total) in totals.iter_mut() {
                    *total += record.number(field).unwrap_or(0.0);
                }
            }

            Ok(QueueStats {
                pending,
                working: working.len(),
                totals,
            })
        })
    }
}

/// Queue removal of `value` found at list position `index`.
fn remove_at(tx: &mut Transaction, key: &str, index: usize, value: &str) {
    if index == 0 {
        tx.pop_head(key);
    } else {
        tx.list_remove(key, value);
    }
}
