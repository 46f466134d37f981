//! Worker process entry point.
//!
//! Attaches to the host's channel, serves commands until the host signals
//! shutdown, and exits on its own if the host disappears.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::bridge::protocol::{WorkCommand, WorkResult};
use crate::channel::{ChannelConfig, DuplexChannel};
use crate::executor::Executor;
use crate::process::{ExitCode, ProcessArguments};
use crate::registry::MethodResolver;
use crate::shm::{NamedEvent, pid_alive};

const SHUTDOWN_WAIT: Duration = Duration::from_millis(10);
const PARENT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Parse `args` (without the program name) and serve until told to stop.
///
/// Returns [`ExitCode::Undefined`] when the arguments are incomplete.
pub fn run_worker<I, S>(resolver: Arc<dyn MethodResolver>, args: I) -> ExitCode
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    match ProcessArguments::parse(args) {
        Ok(args) => run_with_arguments(resolver, &args, &ChannelConfig::default()),
        Err(e) => {
            tracing::error!(error = %e, "Invalid worker arguments");
            ExitCode::Undefined
        }
    }
}

pub fn run_with_arguments(
    resolver: Arc<dyn MethodResolver>,
    args: &ProcessArguments,
    config: &ChannelConfig,
) -> ExitCode {
    if !pid_alive(args.parent_pid) {
        tracing::error!(parent_pid = args.parent_pid, "Parent process is gone");
        return ExitCode::ErrorParentCrash;
    }

    let shutdown = match NamedEvent::open(&args.shutdown_event) {
        Ok(event) => event,
        Err(e) => {
            tracing::error!(error = %e, "Failed to open shutdown event");
            return ExitCode::ErrorCrash;
        }
    };

    let names = args.channel_names();
    let mut channel = match DuplexChannel::<WorkResult, WorkCommand>::worker(&names, config, None) {
        Ok(channel) => channel,
        Err(e) => {
            tracing::error!(error = %e, "Failed to open channel");
            return ExitCode::ErrorCrash;
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let watchdog = {
        let running = running.clone();
        let parent_pid = args.parent_pid;
        thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || watch(shutdown, parent_pid, &running))
    };
    let watchdog = match watchdog {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start watchdog");
            return ExitCode::ErrorCrash;
        }
    };

    tracing::info!(
        parent_pid = args.parent_pid,
        hosted = ?args.hosted.as_ref().map(ToString::to_string),
        "Worker ready"
    );

    let mut executor = Executor::new(resolver, args.hosted.clone());
    executor.run(&channel, &running, config.poll_interval);
    drop(executor);

    channel.wait_for_all_sent();
    channel.shutdown();
    let _ = watchdog.join();

    tracing::info!("Worker stopped");
    ExitCode::Ok
}

/// Clear `running` on the shutdown signal. Exit the process if the parent dies.
fn watch(shutdown: NamedEvent, parent_pid: u32, running: &AtomicBool) {
    let mut last_check = Instant::now();
    while running.load(Ordering::Acquire) {
        if shutdown.wait(SHUTDOWN_WAIT) {
            tracing::info!("Shutdown requested");
            running.store(false, Ordering::Release);
            return;
        }

        if last_check.elapsed() >= PARENT_CHECK_INTERVAL {
            last_check = Instant::now();
            if !pid_alive(parent_pid) {
                tracing::error!(parent_pid, "Parent process exited, terminating");
                std::process::exit(ExitCode::ErrorParentCrash.code());
            }
        }
    }
}
