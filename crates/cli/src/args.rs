use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args as ClapArgs, Parser, Subcommand};

use taskq_core::Topic;
use taskq_infra::StoreConfig;
use taskq_observability::LogFormat;

#[derive(Parser, Debug)]
#[command(name = "taskq")]
#[command(about = "Distributed task queue on Redis", long_about = None)]
pub struct Args {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Queue topic (namespace of all keys)
    #[arg(short, long, env = "TASKQ_TOPIC")]
    pub topic: Topic,

    /// Log format (json, pretty)
    #[arg(long, env = "TASKQ_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Store connection flags; each falls back to the matching `REDIS_*` variable.
#[derive(ClapArgs, Debug)]
pub struct StoreArgs {
    #[arg(long = "redis-host", env = "REDIS_HOST", default_value = "localhost")]
    pub host: String,

    #[arg(long = "redis-port", env = "REDIS_PORT", default_value_t = 6379)]
    pub port: u16,

    #[arg(long = "redis-username", env = "REDIS_USERNAME")]
    pub username: Option<String>,

    #[arg(long = "redis-password", env = "REDIS_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    #[arg(long = "redis-db", env = "REDIS_DB", default_value_t = 0)]
    pub db: i64,

    /// Seconds to wait for a connection
    #[arg(long = "redis-connect-timeout", env = "REDIS_CONNECT_TIMEOUT_SECS", default_value_t = 5)]
    pub connect_timeout: u64,

    /// Retry operations that time out
    #[arg(
        long = "redis-retry-on-timeout",
        env = "REDIS_RETRY_ON_TIMEOUT",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub retry_on_timeout: bool,
}

impl StoreArgs {
    pub fn to_config(&self) -> StoreConfig {
        StoreConfig {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone().filter(|v| !v.is_empty()),
            password: self.password.clone().filter(|v| !v.is_empty()),
            db: self.db,
            connect_timeout: Duration::from_secs(self.connect_timeout),
            retry_on_timeout: self.retry_on_timeout,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Enqueue one task and print its id
    Create {
        /// Payload fields
        #[arg(value_name = "KEY=VALUE", value_parser = parse_field, required = true)]
        fields: Vec<(String, String)>,
    },

    /// Enqueue one task per JSON object line of a file ("-" for stdin)
    Populate {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Requeue working tasks whose heartbeat is older than the timeout
    Cleanup {
        /// Stale threshold in seconds
        #[arg(long, default_value_t = 900)]
        timeout: u64,
    },

    /// Run a cleanup pass, then print queue counts and metric totals
    Report {
        /// Numeric metrics field to total across working tasks
        #[arg(long = "field", default_values_t = ["itps".to_string(), "otps".to_string()])]
        fields: Vec<String>,

        /// Stale threshold in seconds for the cleanup pass
        #[arg(long, default_value_t = 900)]
        timeout: u64,

        /// Also list every working task with its owner and heartbeat
        #[arg(long)]
        tasks: bool,
    },

    /// Run cleanup on a fixed interval until terminated
    Reap {
        /// Seconds between passes
        #[arg(long, default_value_t = 60)]
        interval: u64,

        /// Stale threshold in seconds
        #[arg(long, default_value_t = 900)]
        timeout: u64,
    },

    /// Consume tasks by running PROGRAM once per task
    ///
    /// Payload fields are exported as TASKQ_<KEY> environment variables along
    /// with TASKQ_TASK_ID. Exit status 0 releases the task; anything else
    /// leaves it for cleanup.
    Work {
        /// Heartbeat interval in seconds
        #[arg(long, default_value_t = 30)]
        heartbeat: u64,

        /// Seconds to wait when the queue is empty or after a failed task
        #[arg(long, default_value_t = 5)]
        poll: u64,

        /// Stop after this many failed tasks in a row
        #[arg(long, value_name = "N")]
        max_failures: Option<u32>,

        /// Stop when the queue is empty instead of polling
        #[arg(long)]
        exit_when_empty: bool,

        /// Program and arguments, after `--`
        #[arg(last = true, required = true, value_name = "PROGRAM")]
        program: Vec<String>,
    },
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn parses_create_fields() {
        let args = parse(&["taskq", "--topic", "textbook", "create", "read-from=a/b", "n=1=2"]);
        assert_eq!(args.topic.as_str(), "textbook");
        match args.command {
            Commands::Create { fields } => assert_eq!(
                fields,
                vec![
                    ("read-from".to_string(), "a/b".to_string()),
                    ("n".to_string(), "1=2".to_string()),
                ]
            ),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_field_without_key() {
        assert!(Args::try_parse_from(["taskq", "-t", "q", "create", "=v"]).is_err());
        assert!(Args::try_parse_from(["taskq", "-t", "q", "create", "novalue"]).is_err());
    }

    #[test]
    fn rejects_invalid_topic() {
        assert!(Args::try_parse_from(["taskq", "-t", "a:b", "cleanup"]).is_err());
    }

    #[test]
    fn work_takes_program_after_separator() {
        let args = parse(&[
            "taskq", "-t", "q", "work", "--heartbeat", "10", "--exit-when-empty", "--", "sh", "-c",
            "echo hi",
        ]);
        match args.command {
            Commands::Work {
                heartbeat,
                exit_when_empty,
                max_failures,
                program,
                ..
            } => {
                assert_eq!(heartbeat, 10);
                assert!(exit_when_empty);
                assert_eq!(max_failures, None);
                assert_eq!(program, vec!["sh", "-c", "echo hi"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn work_accepts_failure_limit() {
        let args = parse(&["taskq", "-t", "q", "work", "--max-failures", "3", "--", "true"]);
        match args.command {
            Commands::Work { max_failures, .. } => assert_eq!(max_failures, Some(3)),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn report_defaults_to_throughput_fields() {
        let args = parse(&["taskq", "-t", "q", "report"]);
        match args.command {
            Commands::Report { fields, timeout, tasks } => {
                assert_eq!(fields, vec!["itps", "otps"]);
                assert_eq!(timeout, 900);
                assert!(!tasks);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn store_flags_map_onto_config() {
        let args = parse(&[
            "taskq",
            "-t",
            "q",
            "--redis-host",
            "cache",
            "--redis-port",
            "6380",
            "--redis-db",
            "2",
            "--redis-retry-on-timeout",
            "false",
            "cleanup",
        ]);
        let config = args.store.to_config();
        assert_eq!(config.host, "cache");
        assert_eq!(config.port, 6380);
        assert_eq!(config.db, 2);
        assert!(!config.retry_on_timeout);
    }
}
