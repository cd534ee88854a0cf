//! Queue error model.

use thiserror::Error;

/// Result type used across the queue layer.
pub type QueueResult<T> = Result<T, QueueError>;

/// Failure reported by a store backend.
///
/// Backends classify their native errors into these variants; the retry
/// predicates only ever look at the variant, never at the message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Transport-level failure (dropped connection, refused connection,
    /// I/O error, timeout when the client retries on timeout).
    #[error("store connection error: {0}")]
    Connection(String),

    /// A watched key changed before the transaction committed.
    #[error("transaction aborted: watched key changed")]
    Conflict,

    /// The store rejected a command.
    #[error("store command error: {0}")]
    Command(String),

    /// A reply could not be decoded into the expected shape.
    #[error("store reply decode error: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }
}

/// Queue-level error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A payload was rejected before touching the store.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A topic name cannot be used as a key namespace.
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// A task id cannot be embedded in a key.
    #[error("invalid task id: {0}")]
    InvalidTaskId(String),
}

impl QueueError {
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    pub fn invalid_topic(msg: impl Into<String>) -> Self {
        Self::InvalidTopic(msg.into())
    }

    pub fn invalid_task_id(msg: impl Into<String>) -> Self {
        Self::InvalidTaskId(msg.into())
    }

    /// Connection-class failure (always retryable).
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Store(StoreError::Connection(_)))
    }

    /// Conflict-class failure (retryable only for watch-guarded operations).
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(StoreError::Conflict))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_store_variant() {
        let conn: QueueError = StoreError::connection("reset by peer").into();
        assert!(conn.is_connection());
        assert!(!conn.is_conflict());

        let conflict: QueueError = StoreError::Conflict.into();
        assert!(conflict.is_conflict());
        assert!(!conflict.is_connection());

        let cmd: QueueError = StoreError::command("WRONGTYPE").into();
        assert!(!cmd.is_connection());
        assert!(!cmd.is_conflict());

        assert!(!QueueError::invalid_payload("empty").is_connection());
    }

    #[test]
    fn store_errors_display_transparently() {
        let err: QueueError = StoreError::connection("broken pipe").into();
        assert_eq!(err.to_string(), "store connection error: broken pipe");
    }
}
