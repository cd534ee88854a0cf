use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::DateTime;
use serde_json::{Value, json};
use tracing::info;

use taskq_core::{Payload, TaskId};
use taskq_infra::workers::{Reaper, ReaperConfig};
use taskq_infra::{CleanupReport, RedisStore, Store, TaskQueue};

use crate::args::{Args, Commands};
use crate::work::{self, WorkOptions};

pub fn run(args: Args) -> anyhow::Result<()> {
    let config = args.store.to_config();
    let url = config.display_url();
    let store = RedisStore::new(config).context("invalid store settings")?;
    store
        .ping()
        .with_context(|| format!("cannot reach store at {url}"))?;

    let queue = TaskQueue::new(store, args.topic);

    match args.command {
        Commands::Create { fields } => {
            let payload: Payload = fields.into_iter().collect();
            let id = queue.create(&payload)?;
            println!("{id}");
        }

        Commands::Populate { file } => {
            let created = populate(&queue, &file)?;
            info!(topic = %queue.topic(), created, "populate finished");
        }

        Commands::Cleanup { timeout } => {
            let report = queue.cleanup(Duration::from_secs(timeout))?;
            println!("{}", cleanup_json(&report));
        }

        Commands::Report {
            fields,
            timeout,
            tasks,
        } => {
            let report = queue.cleanup(Duration::from_secs(timeout))?;
            let field_refs: Vec<&str> = fields.iter().map(String::as_str).collect();
            let stats = queue.stats(&field_refs)?;

            let mut out = json!({
                "topic": queue.topic().as_str(),
                "pending": stats.pending,
                "working": stats.working,
                "requeued": report.requeued.len(),
                "totals": stats.totals,
            });
            if tasks {
                out["tasks"] = working_tasks(&queue)?;
            }
            println!("{}", serde_json::to_string_pretty(&out)?);
        }

        Commands::Reap { interval, timeout } => {
            let config = ReaperConfig::default()
                .with_interval(Duration::from_secs(interval))
                .with_timeout(Duration::from_secs(timeout));
            Reaper::new(queue, config).run(None);
        }

        Commands::Work {
            heartbeat,
            poll,
            max_failures,
            exit_when_empty,
            program,
        } => {
            let options = WorkOptions {
                heartbeat: Duration::from_secs(heartbeat),
                poll: Duration::from_secs(poll),
                exit_when_empty,
                max_failures,
            };
            work::run(queue, program, options)?;
        }
    }

    Ok(())
}

/// Enqueue one task per non-blank line; prints each new id.
fn populate<S: Store>(queue: &TaskQueue<S>, path: &Path) -> anyhow::Result<usize> {
    let reader: Box<dyn BufRead> = if path == Path::new("-") {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file =
            File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
        Box::new(BufReader::new(file))
    };

    let mut created = 0;
    for (n, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("cannot read {}", path.display()))?;
        let Some(payload) =
            parse_line(&line).with_context(|| format!("{}:{}", path.display(), n + 1))?
        else {
            continue;
        };
        let id = queue.create(&payload)?;
        println!("{id}");
        created += 1;
    }
    Ok(created)
}

/// Parse one JSON object line into a payload. Strings are taken verbatim,
/// other values in their JSON rendering. Blank lines yield `None`.
fn parse_line(line: &str) -> anyhow::Result<Option<Payload>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let Value::Object(map) = serde_json::from_str::<Value>(line)? else {
        bail!("expected a JSON object");
    };
    if map.is_empty() {
        bail!("empty object");
    }

    let payload = map
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect();
    Ok(Some(payload))
}

fn cleanup_json(report: &CleanupReport) -> Value {
    json!({
        "inspected": report.inspected,
        "requeued": report.requeued,
        "fresh": report.fresh,
        "skipped": report.skipped,
    })
}

fn working_tasks<S: Store>(queue: &TaskQueue<S>) -> anyhow::Result<Value> {
    let mut tasks = Vec::new();

    for raw in queue.working_ids()? {
        let Ok(id) = raw.parse::<TaskId>() else {
            continue;
        };
        let Some(metrics) = queue.metrics(&id)? else {
            tasks.push(json!({ "id": id }));
            continue;
        };

        let mut fields = metrics.as_map().clone();
        for key in ["heartbeat", "last-acquired"] {
            if let Some(at) = fields
                .get(key)
                .and_then(|v| v.parse::<i64>().ok())
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
            {
                fields.insert(key.to_string(), at.to_rfc3339());
            }
        }
        tasks.push(json!({ "id": id, "metrics": fields }));
    }

    Ok(Value::Array(tasks))
}
