//! Demo worker executable.
//!
//! Run with session arguments (as spawned by a host) it serves the demo
//! targets. `shmworker-demo call <method> [args...]` instead plays the host:
//! it spawns itself as a worker, runs one call and prints the result.

use std::sync::Arc;

use anyhow::{Context, bail};
use serde_json::Value;

use shmworker::bridge::protocol::{TargetDescriptor, WorkCommand};
use shmworker::{WorkerConfig, demo, run_and_wait, run_worker};

fn main() -> std::process::ExitCode {
    shmworker::logging::init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("call") {
        return match call(&args[1..]) {
            Ok(()) => std::process::ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("error: {e:#}");
                std::process::ExitCode::FAILURE
            }
        };
    }

    run_worker(Arc::new(demo::registry()), args).into()
}

fn call(args: &[String]) -> anyhow::Result<()> {
    let [method, rest @ ..] = args else {
        bail!("usage: shmworker-demo call <method> [args...]");
    };

    // Arguments are JSON when they parse as JSON, plain strings otherwise.
    let values = rest
        .iter()
        .map(|a| serde_json::from_str(a).unwrap_or_else(|_| Value::String(a.clone())))
        .collect();
    let command = WorkCommand::from_values(TargetDescriptor::new(demo::text(), method), values);

    let exe = std::env::current_exe().context("failed to locate own executable")?;
    let out: Value = run_and_wait(WorkerConfig::new(exe), Arc::new(demo::registry()), command)
        .with_context(|| format!("call to {method} failed"))?;

    println!("{out}");
    Ok(())
}
