//! Redis-backed store.
//!
//! Maps the store capability set onto Redis commands:
//!
//! - lists: `RPUSH` / `LPOP` / `LINDEX` / `LREM key 1` / `LLEN` / `LRANGE`
//! - sets: `SADD` / `SREM` / `SMEMBERS` / `SISMEMBER`
//! - hashes: `HSET` / `HGETALL` / `HGET`, `DEL`
//! - transactions: `WATCH` + `MULTI`/`EXEC` (a nil `EXEC` reply is a conflict)
//! - clock: `TIME`
//!
//! A fresh connection is opened per queue operation, mirroring how WATCH state
//! is scoped to a connection.

use std::collections::BTreeMap;
use std::sync::Arc;

use ::redis::{Commands, IntoConnectionInfo};
use tracing::instrument;

use taskq_core::StoreError;

use super::{Command, Store, StoreConnection, Transaction};
use crate::config::StoreConfig;

/// Redis store client.
#[derive(Debug, Clone)]
pub struct RedisStore {
    client: Arc<::redis::Client>,
    config: StoreConfig,
}

impl RedisStore {
    /// Build a client from explicit settings. No connection is made yet.
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        let mut info = (config.host.clone(), config.port)
            .into_connection_info()
            .map_err(|e| StoreError::connection(e.to_string()))?;
        info.redis.db = config.db;
        info.redis.username = config.username.clone();
        info.redis.password = config.password.clone();

        let client =
            ::redis::Client::open(info).map_err(|e| StoreError::connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            config,
        })
    }

    /// Build a client from a `redis://` URL (tests and tools).
    pub fn from_url(url: impl AsRef<str>) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(url.as_ref())
            .map_err(|e| StoreError::connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            config: StoreConfig::default(),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Round-trip a `PING`, surfacing a clear error when the server is unreachable.
    #[instrument(skip(self), fields(url = %self.config.display_url()), err)]
    pub fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connect()?;
        let _: String = ::redis::cmd("PING")
            .query(&mut conn.conn)
            .map_err(|e| conn.classify(e))?;
        Ok(())
    }
}

impl Store for RedisStore {
    type Connection = RedisConnection;

    fn connect(&self) -> Result<Self::Connection, StoreError> {
        let retry_on_timeout = self.config.retry_on_timeout;
        let conn = self
            .client
            .get_connection_with_timeout(self.config.connect_timeout)
            .map_err(|e| classify(e, retry_on_timeout))?;
        Ok(RedisConnection {
            conn,
            retry_on_timeout,
        })
    }
}

/// One Redis connection (owns its WATCH state).
pub struct RedisConnection {
    conn: ::redis::Connection,
    retry_on_timeout: bool,
}

impl core::fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisConnection")
            .field("retry_on_timeout", &self.retry_on_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisConnection {
    fn classify(&self, err: ::redis::RedisError) -> StoreError {
        classify(err, self.retry_on_timeout)
    }
}

/// Sort a Redis error into connection-class (transient) or command-class.
fn classify(err: ::redis::RedisError, retry_on_timeout: bool) -> StoreError {
    if err.is_timeout() {
        return if retry_on_timeout {
            StoreError::connection(err.to_string())
        } else {
            StoreError::command(err.to_string())
        };
    }
    if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
        return StoreError::connection(err.to_string());
    }
    if err.kind() == ::redis::ErrorKind::TypeError {
        return StoreError::decode(err.to_string());
    }
    StoreError::command(err.to_string())
}

impl StoreConnection for RedisConnection {
    fn watch(&mut self, keys: &[&str]) -> Result<(), StoreError> {
        ::redis::cmd("WATCH")
            .arg(keys)
            .query::<()>(&mut self.conn)
            .map_err(|e| self.classify(e))
    }

    fn unwatch(&mut self) -> Result<(), StoreError> {
        ::redis::cmd("UNWATCH")
            .query::<()>(&mut self.conn)
            .map_err(|e| self.classify(e))
    }

    fn server_time(&mut self) -> Result<i64, StoreError> {
        let (secs, _micros): (i64, i64) = ::redis::cmd("TIME")
            .query(&mut self.conn)
            .map_err(|e| self.classify(e))?;
        Ok(secs)
    }

    fn list_index(&mut self, key: &str, index: isize) -> Result<Option<String>, StoreError> {
        self.conn.lindex(key, index).map_err(|e| self.classify(e))
    }

    fn list_len(&mut self, key: &str) -> Result<usize, StoreError> {
        self.conn.llen(key).map_err(|e| self.classify(e))
    }

    fn list_range(&mut self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError> {
        self.conn
            .lrange(key, start, stop)
            .map_err(|e| self.classify(e))
    }

    fn set_members(&mut self, key: &str) -> Result<Vec<String>, StoreError> {
        self.conn.smembers(key).map_err(|e| self.classify(e))
    }

    fn set_contains(&mut self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.conn
            .sismember(key, member)
            .map_err(|e| self.classify(e))
    }

    fn hash_get_all(&mut self, key: &str) -> Result<BTreeMap<String, String>, StoreError> {
        self.conn.hgetall(key).map_err(|e| self.classify(e))
    }

    fn hash_get(&mut self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.conn.hget(key, field).map_err(|e| self.classify(e))
    }

    fn exec(&mut self, tx: &Transaction) -> Result<(), StoreError> {
        let mut pipe = ::redis::pipe();
        pipe.atomic();

        for command in tx.commands() {
            match command {
                Command::PushTail { key, value } => {
                    pipe.cmd("RPUSH").arg(key).arg(value).ignore();
                }
                Command::PopHead { key } => {
                    pipe.cmd("LPOP").arg(key).ignore();
                }
                Command::ListRemove { key, value } => {
                    pipe.cmd("LREM").arg(key).arg(1).arg(value).ignore();
                }
                Command::SetAdd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member).ignore();
                }
                Command::SetRemove { key, member } => {
                    pipe.cmd("SREM").arg(key).arg(member).ignore();
                }
                Command::HashSet { key, fields } => {
                    pipe.cmd("HSET").arg(key);
                    for (field, value) in fields {
                        pipe.arg(field).arg(value);
                    }
                    pipe.ignore();
                }
                Command::Delete { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
            }
        }

        // EXEC replies nil when a watched key changed.
        let reply: Option<()> = pipe.query(&mut self.conn).map_err(|e| self.classify(e))?;
        match reply {
            Some(()) => Ok(()),
            None => Err(StoreError::Conflict),
        }
    }
}
