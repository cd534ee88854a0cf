//! Per-topic key schema.
//!
//! Every key a queue touches is derived from its topic, so unrelated queues can
//! share one store without seeing each other's tasks:
//!
//! | Purpose          | Key                  | Type |
//! |------------------|----------------------|------|
//! | pending backlog  | `T:pending`          | list |
//! | working set      | `T:working`          | set  |
//! | task payload     | `T:listing:{id}`     | hash |
//! | task metrics     | `T:metrics:{id}`     | hash |
//! | quarantined ids  | `T:quarantine`       | list |

use core::str::FromStr;

use crate::error::QueueError;
use crate::id::TaskId;

/// A validated queue namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Result<Self, QueueError> {
        let name = name.into();
        if name.is_empty() {
            return Err(QueueError::invalid_topic("empty"));
        }
        if name.chars().any(|c| c == ':' || c.is_whitespace()) {
            return Err(QueueError::invalid_topic(format!(
                "{name:?} contains ':' or whitespace"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Topic {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Key names for one topic.
///
/// Collection keys are computed once; per-task keys are built on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySchema {
    topic: Topic,
    pending: String,
    working: String,
    quarantine: String,
}

impl KeySchema {
    pub fn new(topic: Topic) -> Self {
        Self {
            pending: format!("{topic}:pending"),
            working: format!("{topic}:working"),
            quarantine: format!("{topic}:quarantine"),
            topic,
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }

    pub fn working(&self) -> &str {
        &self.working
    }

    pub fn quarantine(&self) -> &str {
        &self.quarantine
    }

    pub fn listing(&self, id: &TaskId) -> String {
        format!("{}:listing:{}", self.topic, id)
    }

    pub fn metrics(&self, id: &TaskId) -> String {
        format!("{}:metrics:{}", self.topic, id)
    }
}
