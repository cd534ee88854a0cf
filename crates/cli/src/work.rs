//! Runs an external program per task.

use std::io;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, bail};
use tracing::{debug, info};

use taskq_core::{Payload, TaskId};
use taskq_infra::workers::{Consumer, ConsumerConfig, TaskContext};
use taskq_infra::{Store, TaskQueue};

/// Environment variable carrying the task id.
pub const TASK_ID_VAR: &str = "TASKQ_TASK_ID";

#[derive(Debug, Clone)]
pub struct WorkOptions {
    pub heartbeat: Duration,
    pub poll: Duration,
    pub exit_when_empty: bool,
    pub max_failures: Option<u32>,
}

/// Environment handed to the program: `TASKQ_TASK_ID` plus one `TASKQ_<KEY>`
/// per payload field, with the key upper-cased and every character outside
/// `[A-Z0-9]` replaced by `_`.
pub fn task_env(id: &TaskId, payload: &Payload) -> Vec<(String, String)> {
    let mut env = Vec::with_capacity(payload.len() + 1);
    env.push((TASK_ID_VAR.to_string(), id.to_string()));

    for (key, value) in payload {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        env.push((format!("TASKQ_{name}"), value.clone()));
    }
    env
}

fn run_program(program: &[String], id: &TaskId, payload: &Payload) -> anyhow::Result<()> {
    let Some((bin, args)) = program.split_first() else {
        bail!("no program given");
    };

    debug!(task_id = %id, program = %bin, "starting task program");
    let status = Command::new(bin)
        .args(args)
        .envs(task_env(id, payload))
        .status()
        .with_context(|| format!("failed to start `{bin}`"))?;

    if !status.success() {
        bail!("`{bin}` exited with {status}");
    }
    Ok(())
}

/// The program could not be started at all, so every other task would fail
/// the same way.
fn is_start_failure(err: &anyhow::Error) -> bool {
    err.downcast_ref::<io::Error>().is_some()
}

pub fn run<S: Store>(queue: TaskQueue<S>, program: Vec<String>, options: WorkOptions) -> anyhow::Result<()> {
    if program.is_empty() {
        bail!("no program given");
    }

    let config = ConsumerConfig::default()
        .with_name("taskq-work")
        .with_heartbeat_interval(options.heartbeat)
        .with_poll_interval(options.poll)
        .exit_when_empty(options.exit_when_empty)
        .with_max_consecutive_failures(options.max_failures);

    let consumer = Consumer::new(queue, config);
    let stats = consumer.run(
        |ctx: &TaskContext<'_, S>, payload: &Payload| {
            run_program(&program, ctx.id(), payload).inspect_err(|err| {
                if is_start_failure(err) {
                    ctx.stop_consumer();
                }
            })
        },
        None,
    );

    info!(
        released = stats.tasks_released,
        failed = stats.tasks_failed,
        "work finished"
    );
    if stats.tasks_failed > 0 {
        bail!("{} task(s) failed and were left for cleanup", stats.tasks_failed);
    }
    Ok(())
}
