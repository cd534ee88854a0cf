//! Task identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

/// Opaque identifier of a task.
///
/// Fresh ids are 32 lowercase hex characters (122 random bits from a v4 UUID).
/// Ids read back from a store are accepted as-is as long as they can be
/// embedded in a key, so queues populated by older producers keep working.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    /// Generate a new random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl core::fmt::Display for TaskId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for TaskId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(QueueError::invalid_task_id("empty"));
        }
        if s.chars().any(|c| c == ':' || c.is_whitespace()) {
            return Err(QueueError::invalid_task_id(format!(
                "{s:?} contains ':' or whitespace"
            )));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for TaskId {
    type Error = QueueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TaskId> for String {
    fn from(value: TaskId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_ids_are_hex_and_distinct() {
        let ids: HashSet<TaskId> = (0..1000).map(|_| TaskId::generate()).collect();
        assert_eq!(ids.len(), 1000);
        for id in &ids {
            assert_eq!(id.as_str().len(), 32);
            assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn legacy_short_ids_parse() {
        let id: TaskId = "9f86d081884c7d65".parse().unwrap();
        assert_eq!(id.to_string(), "9f86d081884c7d65");
    }

    #[test]
    fn rejects_ids_that_would_break_keys() {
        assert!("".parse::<TaskId>().is_err());
        assert!("a:b".parse::<TaskId>().is_err());
        assert!("a b".parse::<TaskId>().is_err());
    }

    #[test]
    fn deserializing_applies_the_same_validation() {
        let id: TaskId = serde_json::from_str("\"9f86d081884c7d65\"").unwrap();
        assert_eq!(id.as_str(), "9f86d081884c7d65");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"9f86d081884c7d65\"");

        assert!(serde_json::from_str::<TaskId>("\"a:b\"").is_err());
        assert!(serde_json::from_str::<TaskId>("\"a b\"").is_err());
        assert!(serde_json::from_str::<TaskId>("\"\"").is_err());
    }
}
