//! `taskq`: operate a task queue from the command line.

mod args;
mod commands;
mod work;

use clap::Parser;

use args::Args;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    taskq_observability::tracing::init(args.log_format);

    commands::run(args)
}
