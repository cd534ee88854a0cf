//! Store connection settings.
//!
//! Built by the caller (or from the environment) and injected into the store
//! client before the client is handed to a queue.

use std::time::Duration;

/// Connection settings for the backing store.
#[derive(Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Logical database index.
    pub db: i64,
    pub connect_timeout: Duration,
    /// Treat command/connect timeouts as transient (retried) failures.
    pub retry_on_timeout: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            username: None,
            password: None,
            db: 0,
            connect_timeout: Duration::from_secs(5),
            retry_on_timeout: true,
        }
    }
}

impl core::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("db", &self.db)
            .field("connect_timeout", &self.connect_timeout)
            .field("retry_on_timeout", &self.retry_on_timeout)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is not valid: {reason}")]
    Invalid { var: &'static str, reason: String },
}

impl StoreConfig {
    /// Read settings from `REDIS_*` environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// | Variable                     | Default     |
    /// |------------------------------|-------------|
    /// | `REDIS_HOST`                 | `localhost` |
    /// | `REDIS_PORT`                 | `6379`      |
    /// | `REDIS_USERNAME`             | unset       |
    /// | `REDIS_PASSWORD`             | unset       |
    /// | `REDIS_DB`                   | `0`         |
    /// | `REDIS_CONNECT_TIMEOUT_SECS` | `5`         |
    /// | `REDIS_RETRY_ON_TIMEOUT`     | `true`      |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Ok(Self {
            host: lookup("REDIS_HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "REDIS_PORT")?.unwrap_or(defaults.port),
            username: lookup("REDIS_USERNAME").filter(|v| !v.is_empty()),
            password: lookup("REDIS_PASSWORD").filter(|v| !v.is_empty()),
            db: parse_var(&lookup, "REDIS_DB")?.unwrap_or(defaults.db),
            connect_timeout: parse_var::<u64, _>(&lookup, "REDIS_CONNECT_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            retry_on_timeout: parse_var(&lookup, "REDIS_RETRY_ON_TIMEOUT")?
                .unwrap_or(defaults.retry_on_timeout),
        })
    }

    /// `redis://` URL for logs and tools; the password is never included.
    pub fn display_url(&self) -> String {
        match &self.username {
            Some(user) => format!("redis://{user}@{}:{}/{}", self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| vars.get(k).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = StoreConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.display_url(), "redis://localhost:6379/0");
    }

    #[test]
    fn reads_every_variable() {
        let config = StoreConfig::from_lookup(lookup(&[
            ("REDIS_HOST", "cache.internal"),
            ("REDIS_PORT", "6380"),
            ("REDIS_USERNAME", "worker"),
            ("REDIS_PASSWORD", "s3cret"),
            ("REDIS_DB", "3"),
            ("REDIS_CONNECT_TIMEOUT_SECS", "10"),
            ("REDIS_RETRY_ON_TIMEOUT", "false"),
        ]))
        .unwrap();

        assert_eq!(config.host, "cache.internal");
        assert_eq!(config.port, 6380);
        assert_eq!(config.username.as_deref(), Some("worker"));
        assert_eq!(config.password.as_deref(), Some("s3cret"));
        assert_eq!(config.db, 3);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(!config.retry_on_timeout);
        assert_eq!(config.display_url(), "redis://worker@cache.internal:6380/3");
    }

    #[test]
    fn rejects_malformed_numbers() {
        let err = StoreConfig::from_lookup(lookup(&[("REDIS_PORT", "sixty")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "REDIS_PORT", .. }));
    }

    #[test]
    fn debug_output_hides_password() {
        let config = StoreConfig {
            password: Some("hunter2".to_string()),
            ..Default::default()
        };
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
