//! Per-task records stored as string hashes.

use std::collections::BTreeMap;

/// Immutable task input, written once at creation.
pub type Payload = BTreeMap<String, String>;

/// Well-known metrics fields.
pub mod fields {
    /// Last liveness timestamp (store-server seconds since the Unix epoch).
    pub const HEARTBEAT: &str = "heartbeat";
    pub const LAST_ACQUIRED: &str = "last-acquired";
    pub const HOSTNAME: &str = "hostname";
    pub const PID: &str = "pid";
}

/// Mutable liveness/telemetry record of a task.
///
/// Holds the well-known fields written by the queue plus whatever fields
/// workers report through `update`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsRecord(BTreeMap<String, String>);

impl MetricsRecord {
    pub fn new(fields: BTreeMap<String, String>) -> Self {
        Self(fields)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    /// Heartbeat in server seconds, if present and well-formed.
    pub fn heartbeat(&self) -> Option<i64> {
        self.get(fields::HEARTBEAT).and_then(|v| v.parse().ok())
    }

    pub fn last_acquired(&self) -> Option<i64> {
        self.get(fields::LAST_ACQUIRED).and_then(|v| v.parse().ok())
    }

    pub fn hostname(&self) -> Option<&str> {
        self.get(fields::HOSTNAME)
    }

    pub fn pid(&self) -> Option<u32> {
        self.get(fields::PID).and_then(|v| v.parse().ok())
    }

    /// Numeric view of a caller-supplied field (e.g. a throughput counter).
    pub fn number(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(|v| v.parse().ok())
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl From<BTreeMap<String, String>> for MetricsRecord {
    fn from(value: BTreeMap<String, String>) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> MetricsRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>()
            .into()
    }

    #[test]
    fn typed_accessors() {
        let m = record(&[
            ("heartbeat", "1700000000"),
            ("last-acquired", "1699999990"),
            ("hostname", "node-7"),
            ("pid", "4242"),
            ("itps", "1234.5"),
        ]);

        assert_eq!(m.heartbeat(), Some(1_700_000_000));
        assert_eq!(m.last_acquired(), Some(1_699_999_990));
        assert_eq!(m.hostname(), Some("node-7"));
        assert_eq!(m.pid(), Some(4242));
        assert_eq!(m.number("itps"), Some(1234.5));
        assert_eq!(m.number("otps"), None);
    }

    #[test]
    fn malformed_heartbeat_reads_as_missing() {
        let m = record(&[("heartbeat", "2025-04-04T10:00:00")]);
        assert_eq!(m.heartbeat(), None);
    }
}
