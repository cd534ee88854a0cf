//! Queue options and operation reports.

use std::collections::BTreeMap;

use taskq_core::TaskId;

use crate::retry::RetryPolicy;

/// What `acquire` does with a pending id whose payload record is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptEntryPolicy {
    /// Leave the entry where it is and consider the next pending position,
    /// looking at most `max_scan` positions deep.
    Skip { max_scan: usize },
    /// Move the entry to the topic's quarantine list for inspection, then
    /// retry from the head.
    Quarantine,
    /// Report "no task available" for this attempt.
    Stall,
}

impl Default for CorruptEntryPolicy {
    fn default() -> Self {
        Self::Skip { max_scan: 64 }
    }
}

/// Per-queue tuning, passed alongside the store at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    /// Used by `create`, `update` and inspection reads.
    pub connection_retry: RetryPolicy,
    /// Used by the watch-guarded operations: `acquire`, `release`, `cleanup`.
    pub conflict_retry: RetryPolicy,
    pub corrupt_entry_policy: CorruptEntryPolicy,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            connection_retry: RetryPolicy::connection(),
            conflict_retry: RetryPolicy::conflict(),
            corrupt_entry_policy: CorruptEntryPolicy::default(),
        }
    }
}

impl QueueOptions {
    pub fn with_connection_retry(mut self, policy: RetryPolicy) -> Self {
        self.connection_retry = policy;
        self
    }

    pub fn with_conflict_retry(mut self, policy: RetryPolicy) -> Self {
        self.conflict_retry = policy;
        self
    }

    pub fn with_corrupt_entry_policy(mut self, policy: CorruptEntryPolicy) -> Self {
        self.corrupt_entry_policy = policy;
        self
    }
}

/// Outcome of one `cleanup` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Working-set members looked at.
    pub inspected: usize,
    /// Ids moved back to the pending tail, in the order they were requeued.
    pub requeued: Vec<TaskId>,
    /// Members whose heartbeat was within the timeout.
    pub fresh: usize,
    /// Members that left the working set before they could be checked, or
    /// that could not be parsed as ids.
    pub skipped: usize,
}

/// Snapshot of a topic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    pub pending: usize,
    pub working: usize,
    /// Sum of each requested numeric metrics field across working tasks.
    /// Missing or non-numeric values count as zero.
    pub totals: BTreeMap<String, f64>,
}
