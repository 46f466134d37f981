//! Host-side facade: one worker process plus its dispatcher.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::bridge::protocol::{RequestId, TypeRef, WorkCommand};
use crate::channel::ChannelConfig;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::process::{ExitCode, ProcessArguments};
use crate::registry::MethodResolver;
use crate::supervisor::{ExecutableSpawner, SpawnError, WorkerProcess, WorkerSpawner};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to start worker: {0}")]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

pub struct WorkerConfig {
    pub session_name: Option<String>,
    pub hosted: Option<TypeRef>,
    /// How long a worker gets to exit after the shutdown signal before it is killed.
    pub shutdown_timeout: Duration,
    /// Default for [`ProcessWorker::execute_wait`]. `None` waits forever.
    pub call_timeout: Option<Duration>,
    pub channel: ChannelConfig,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl WorkerConfig {
    /// Launch `program` as the worker executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self::from_spawner(Arc::new(ExecutableSpawner::new(program)))
    }

    pub fn from_spawner(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            session_name: None,
            hosted: None,
            shutdown_timeout: Duration::from_secs(5),
            call_timeout: None,
            channel: ChannelConfig::default(),
            spawner,
        }
    }

    pub fn with_session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = Some(name.into());
        self
    }

    pub fn with_hosted(mut self, type_ref: TypeRef) -> Self {
        self.hosted = Some(type_ref);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel = config;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

/// A running worker. Dropping it shuts the worker down.
pub struct ProcessWorker {
    session: String,
    dispatcher: Arc<Dispatcher>,
    process: Option<WorkerProcess>,
    shutdown_timeout: Duration,
    call_timeout: Option<Duration>,
    disposing: Arc<AtomicBool>,
}

impl ProcessWorker {
    /// Create the session's named objects and launch the worker.
    pub fn spawn(
        config: WorkerConfig,
        resolver: Arc<dyn MethodResolver>,
    ) -> Result<Self, WorkerError> {
        let session = config
            .session_name
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let args = ProcessArguments::for_session(&session, config.hosted.clone());

        let dispatcher = Arc::new(Dispatcher::connect(
            &args.channel_names(),
            &config.channel,
            resolver,
            config.hosted,
        )?);
        let process = WorkerProcess::spawn(config.spawner.as_ref(), &args)?;
        dispatcher.set_probe(process.probe());

        let disposing = Arc::new(AtomicBool::new(false));
        process.on_exit({
            let dispatcher = Arc::downgrade(&dispatcher);
            let disposing = disposing.clone();
            let session = session.clone();
            move |code| {
                if code.is_ok() || disposing.load(Ordering::Acquire) {
                    return;
                }
                tracing::error!(%session, %code, "Worker crashed, tearing down channel");
                if let Some(dispatcher) = dispatcher.upgrade() {
                    dispatcher.shutdown();
                }
            }
        });

        tracing::info!(%session, pid = process.pid(), "Worker started");

        Ok(Self {
            session,
            dispatcher,
            process: Some(process),
            shutdown_timeout: config.shutdown_timeout,
            call_timeout: config.call_timeout,
            disposing,
        })
    }

    pub fn session_name(&self) -> &str {
        &self.session
    }

    pub fn hosted_type(&self) -> Option<&TypeRef> {
        self.dispatcher.hosted_type()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(WorkerProcess::pid)
    }

    pub fn exit_code(&self) -> Option<ExitCode> {
        self.process.as_ref().and_then(WorkerProcess::exit_code)
    }

    /// Enqueue without waiting.
    pub fn execute(&self, command: WorkCommand) -> Result<RequestId, DispatchError> {
        self.check_alive()?;
        self.dispatcher.submit(command)
    }

    /// Submit and wait using the configured call timeout.
    pub fn execute_wait<T: DeserializeOwned>(
        &self,
        command: WorkCommand,
    ) -> Result<T, DispatchError> {
        self.execute_wait_for(command, self.call_timeout)
    }

    pub fn execute_wait_for<T: DeserializeOwned>(
        &self,
        command: WorkCommand,
        timeout: Option<Duration>,
    ) -> Result<T, DispatchError> {
        self.check_alive()?;
        self.dispatcher.call(command, timeout)
    }

    pub fn execute_void(&self, command: WorkCommand) -> Result<(), DispatchError> {
        self.check_alive()?;
        self.dispatcher.call_void(command, self.call_timeout)
    }

    pub fn is_ready(&self, id: &RequestId) -> bool {
        self.dispatcher.is_ready(id)
    }

    pub fn get_result(&self, id: &RequestId) -> Result<Option<Value>, DispatchError> {
        self.dispatcher.fetch(id)
    }

    pub fn get_result_as<T: DeserializeOwned>(
        &self,
        id: &RequestId,
    ) -> Result<Option<T>, DispatchError> {
        self.dispatcher.fetch_as(id)
    }

    /// Wait for a previously submitted command.
    pub fn wait_for(
        &self,
        id: &RequestId,
        timeout: Option<Duration>,
    ) -> Result<Option<Value>, DispatchError> {
        self.dispatcher.wait(id, timeout)
    }

    pub fn on_work_complete(&self, hook: impl Fn(RequestId) + Send + Sync + 'static) {
        self.dispatcher.on_work_complete(hook);
    }

    pub fn on_exit(&self, hook: impl FnOnce(ExitCode) + Send + 'static) {
        if let Some(process) = &self.process {
            process.on_exit(hook);
        }
    }

    /// Flush the channel, ask the worker to exit, and kill it after the
    /// shutdown timeout. Returns the exit code when known.
    ///
    /// Results not fetched before this point are discarded.
    pub fn dispose(&mut self) -> Option<ExitCode> {
        let process = self.process.take()?;
        self.disposing.store(true, Ordering::Release);

        self.dispatcher.shutdown();
        let code = process.request_shutdown(self.shutdown_timeout);
        tracing::info!(session = %self.session, code = ?code, "Worker disposed");
        code
    }

    fn check_alive(&self) -> Result<(), DispatchError> {
        match self.exit_code() {
            Some(exit_code) if !exit_code.is_ok() => {
                self.dispatcher.shutdown();
                Err(DispatchError::WorkerCrashed { exit_code })
            }
            _ => Ok(()),
        }
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for ProcessWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessWorker")
            .field("session", &self.session)
            .field("pid", &self.pid())
            .field("hosted", &self.hosted_type())
            .finish()
    }
}

/// Spawn a worker, run one command to completion, and shut the worker down.
pub fn run_and_wait<T: DeserializeOwned>(
    config: WorkerConfig,
    resolver: Arc<dyn MethodResolver>,
    command: WorkCommand,
) -> Result<T, WorkerError> {
    let mut worker = ProcessWorker::spawn(config, resolver)?;
    let result = worker.execute_wait(command);
    worker.dispose();
    Ok(result?)
}
