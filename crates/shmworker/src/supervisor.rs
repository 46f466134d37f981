//! Worker process lifecycle.
//!
//! Spawns the worker through a [`WorkerSpawner`], watches for its exit on a
//! background thread, and shuts it down by signalling the named shutdown
//! event first and killing only after a grace period.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::dispatcher::WorkerProbe;
use crate::process::{ExitCode, ProcessArguments};
use crate::shm::{NamedEvent, ShmError};

const WATCH_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("failed to create shutdown event: {0}")]
    ShutdownEvent(#[from] ShmError),

    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker launch strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, args: &ProcessArguments) -> Result<Child, SpawnError>;
}

/// Launches a worker executable with the session arguments appended.
#[derive(Debug, Clone)]
pub struct ExecutableSpawner {
    program: PathBuf,
    leading_args: Vec<String>,
}

impl ExecutableSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Arguments placed before the session tokens, e.g. a subcommand.
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl WorkerSpawner for ExecutableSpawner {
    fn spawn(&self, args: &ProcessArguments) -> Result<Child, SpawnError> {
        let child = Command::new(&self.program)
            .args(&self.leading_args)
            .args(args.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;
        Ok(child)
    }
}

pub type ExitHook = Box<dyn FnOnce(ExitCode) + Send>;

struct ProcessState {
    pid: u32,
    child: Mutex<Child>,
    exit: OnceLock<ExitCode>,
    hooks: Mutex<Vec<ExitHook>>,
}

impl ProcessState {
    fn child(&self) -> MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hooks(&self) -> MutexGuard<'_, Vec<ExitHook>> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reap the child if it has exited. Returns the recorded exit code.
    fn poll(&self) -> Option<ExitCode> {
        if let Some(code) = self.exit.get() {
            return Some(*code);
        }

        let status = match self.child().try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(pid = self.pid, error = %e, "Failed to poll worker process");
                return None;
            }
        };

        let code = ExitCode::from_status(status);
        let hooks = {
            let mut hooks = self.hooks();
            if self.exit.set(code).is_err() {
                return self.exit.get().copied();
            }
            std::mem::take(&mut *hooks)
        };

        if code.is_ok() {
            tracing::info!(pid = self.pid, %code, "Worker process exited");
        } else {
            tracing::warn!(pid = self.pid, %code, %status, "Worker process exited abnormally");
        }
        for hook in hooks {
            hook(code);
        }
        Some(code)
    }
}

impl WorkerProbe for ProcessState {
    fn exit_code(&self) -> Option<ExitCode> {
        self.poll()
    }
}

/// A spawned worker and its shutdown event.
pub struct WorkerProcess {
    state: Arc<ProcessState>,
    shutdown_event: NamedEvent,
    watching: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
    shutdown_requested: AtomicBool,
}

impl WorkerProcess {
    /// Create the shutdown event, then launch the worker.
    pub fn spawn(spawner: &dyn WorkerSpawner, args: &ProcessArguments) -> Result<Self, SpawnError> {
        let shutdown_event = NamedEvent::create(&args.shutdown_event)?;
        let child = spawner.spawn(args)?;
        let pid = child.id();
        tracing::info!(pid, session = %args.server_name, "Spawned worker process");

        let state = Arc::new(ProcessState {
            pid,
            child: Mutex::new(child),
            exit: OnceLock::new(),
            hooks: Mutex::new(Vec::new()),
        });
        let watching = Arc::new(AtomicBool::new(true));

        let watcher = thread::Builder::new()
            .name(format!("watch-{pid}"))
            .spawn({
                let state = state.clone();
                let watching = watching.clone();
                move || {
                    while watching.load(Ordering::Acquire) {
                        if state.poll().is_some() {
                            break;
                        }
                        thread::sleep(WATCH_INTERVAL);
                    }
                }
            })?;

        Ok(Self {
            state,
            shutdown_event,
            watching,
            watcher: Some(watcher),
            shutdown_requested: AtomicBool::new(false),
        })
    }

    pub fn pid(&self) -> u32 {
        self.state.pid
    }

    pub fn exit_code(&self) -> Option<ExitCode> {
        self.state.poll()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_code().is_some()
    }

    pub fn probe(&self) -> Arc<dyn WorkerProbe> {
        self.state.clone()
    }

    /// Run `hook` once with the exit code. Runs immediately if the worker
    /// already exited.
    pub fn on_exit(&self, hook: impl FnOnce(ExitCode) + Send + 'static) {
        let mut hooks = self.state.hooks();
        match self.state.exit.get() {
            Some(code) => {
                let code = *code;
                drop(hooks);
                hook(code);
            }
            None => hooks.push(Box::new(hook)),
        }
    }

    /// Wait up to `timeout` for the worker to exit on its own.
    pub fn wait_for_exit(&self, timeout: Duration) -> Option<ExitCode> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(code) = self.exit_code() {
                return Some(code);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(WATCH_INTERVAL);
        }
    }

    /// Signal the worker to stop, give it `grace` to comply, then kill it.
    ///
    /// Only the first call does anything.
    pub fn request_shutdown(&self, grace: Duration) -> Option<ExitCode> {
        if self.shutdown_requested.swap(true, Ordering::AcqRel) {
            return self.exit_code();
        }

        self.shutdown_event.set();
        if let Some(code) = self.wait_for_exit(grace) {
            return Some(code);
        }

        tracing::warn!(pid = self.pid(), ?grace, "Worker ignored shutdown request, killing");
        {
            let mut child = self.state.child();
            if let Err(e) = child.kill() {
                tracing::warn!(pid = self.pid(), error = %e, "Failed to kill worker process");
            }
        }
        self.wait_for_exit(Duration::from_secs(5))
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.request_shutdown(Duration::ZERO);
        self.watching.store(false, Ordering::Release);
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }
    }
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("pid", &self.state.pid)
            .field("exit", &self.state.exit.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// Runs a shell snippet and ignores the session arguments.
    struct ShellSpawner(&'static str);

    impl WorkerSpawner for ShellSpawner {
        fn spawn(&self, _args: &ProcessArguments) -> Result<Child, SpawnError> {
            Ok(Command::new("sh").args(["-c", self.0]).spawn()?)
        }
    }

    fn args() -> ProcessArguments {
        ProcessArguments::for_session(&format!("sup_{}", uuid::Uuid::new_v4().simple()), None)
    }

    #[test]
    fn reports_clean_exit() {
        let process = WorkerProcess::spawn(&ShellSpawner("exit 1"), &args()).unwrap();
        assert_eq!(process.wait_for_exit(Duration::from_secs(5)), Some(ExitCode::Ok));
        assert!(process.has_exited());
    }

    #[test]
    fn exit_hook_receives_code() {
        let process = WorkerProcess::spawn(&ShellSpawner("sleep 0.1; exit 3"), &args()).unwrap();
        let (tx, rx) = mpsc::channel();
        process.on_exit(move |code| {
            let _ = tx.send(code);
        });
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ExitCode::ErrorCrash
        );
    }

    #[test]
    fn late_exit_hook_runs_immediately() {
        let process = WorkerProcess::spawn(&ShellSpawner("exit 1"), &args()).unwrap();
        process.wait_for_exit(Duration::from_secs(5)).unwrap();

        let (tx, rx) = mpsc::channel();
        process.on_exit(move |code| {
            let _ = tx.send(code);
        });
        assert_eq!(rx.try_recv().unwrap(), ExitCode::Ok);
    }

    #[test]
    fn shutdown_kills_unresponsive_worker() {
        let process = WorkerProcess::spawn(&ShellSpawner("sleep 30"), &args()).unwrap();
        assert!(!process.has_exited());

        let started = Instant::now();
        let code = process.request_shutdown(Duration::from_millis(100));
        assert_eq!(code, Some(ExitCode::ErrorCrash));
        assert!(started.elapsed() < Duration::from_secs(10));

        // Second request is a no-op.
        assert_eq!(process.request_shutdown(Duration::ZERO), Some(ExitCode::ErrorCrash));
    }

    #[test]
    fn probe_tracks_exit() {
        let process = WorkerProcess::spawn(&ShellSpawner("sleep 0.05; exit 1"), &args()).unwrap();
        let probe = process.probe();
        process.wait_for_exit(Duration::from_secs(5)).unwrap();
        assert_eq!(probe.exit_code(), Some(ExitCode::Ok));
    }

    #[test]
    fn executable_spawner_passes_session_tokens() {
        let args = args();
        let script = concat!(
            r#"case "$1" in -S=*_Server) ;; *) exit 9;; esac; "#,
            r#"case "$4" in -X=[0-9]*) exit 1;; esac; exit 8"#,
        );
        let spawner = ExecutableSpawner::new("sh").with_leading_args(["-c", script, "worker"]);
        let mut child = spawner.spawn(&args).unwrap();
        assert_eq!(child.wait().unwrap().code(), Some(1));
    }
}
