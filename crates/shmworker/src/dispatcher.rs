//! Host-side request/response correlation.
//!
//! Commands are validated against the local resolver, tagged with a fresh
//! [`RequestId`] and enqueued. The receive pump stores each [`WorkResult`]
//! in a concurrent map until the caller fetches it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::bridge::protocol::{RemoteError, RequestId, TypeRef, WorkCommand, WorkResult};
use crate::channel::{
    ChannelConfig, ChannelError, ChannelNames, DuplexChannel, Inbox, MessageHandler,
};
use crate::process::ExitCode;
use crate::registry::{MethodKind, MethodResolver};

/// Called on the receive pump thread when a result is stored.
pub type CompletionHook = Arc<dyn Fn(RequestId) + Send + Sync>;

/// Reports whether the worker process has exited.
pub trait WorkerProbe: Send + Sync {
    fn exit_code(&self) -> Option<ExitCode>;
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("remote call failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("worker process exited: {exit_code}")]
    WorkerCrashed { exit_code: ExitCode },

    #[error("timed out after {0:?} waiting for result")]
    Timeout(Duration),

    #[error("dispatcher has been shut down")]
    Disposed,

    #[error("failed to decode result: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

type HostChannel = DuplexChannel<WorkCommand, WorkResult>;

pub struct Dispatcher {
    channel: Mutex<Option<HostChannel>>,
    results: Arc<DashMap<RequestId, WorkResult>>,
    hooks: Arc<RwLock<Vec<CompletionHook>>>,
    resolver: Arc<dyn MethodResolver>,
    hosted: Option<TypeRef>,
    probe: RwLock<Option<Arc<dyn WorkerProbe>>>,
    disposed: AtomicBool,
    poll_interval: Duration,
}

impl Dispatcher {
    /// Create the session's channel objects and start pumping.
    pub fn connect(
        names: &ChannelNames,
        config: &ChannelConfig,
        resolver: Arc<dyn MethodResolver>,
        hosted: Option<TypeRef>,
    ) -> Result<Self, DispatchError> {
        let results: Arc<DashMap<RequestId, WorkResult>> = Arc::new(DashMap::new());
        let hooks: Arc<RwLock<Vec<CompletionHook>>> = Arc::new(RwLock::new(Vec::new()));

        let handler: MessageHandler<WorkResult> = {
            let results = results.clone();
            let hooks = hooks.clone();
            Arc::new(move |inbox: &Inbox<WorkResult>| store_results(inbox, &results, &hooks))
        };

        let channel = DuplexChannel::host(names, config, Some(handler))?;

        Ok(Self {
            channel: Mutex::new(Some(channel)),
            results,
            hooks,
            resolver,
            hosted,
            probe: RwLock::new(None),
            disposed: AtomicBool::new(false),
            poll_interval: config.poll_interval,
        })
    }

    /// Attach the process whose exit turns pending waits into crash errors.
    pub fn set_probe(&self, probe: Arc<dyn WorkerProbe>) {
        *self.probe.write().unwrap_or_else(PoisonError::into_inner) = Some(probe);
    }

    pub fn on_work_complete(&self, hook: impl Fn(RequestId) + Send + Sync + 'static) {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(hook));
    }

    pub fn hosted_type(&self) -> Option<&TypeRef> {
        self.hosted.as_ref()
    }

    /// Validate and enqueue under a fresh id. Invalid targets never reach the channel.
    ///
    /// Every submission gets its own id, so resubmitting a command runs it again
    /// and yields a second, separately fetchable result.
    pub fn submit(&self, mut command: WorkCommand) -> Result<RequestId, DispatchError> {
        self.ensure_live()?;
        self.validate(&command)?;

        let id = RequestId::new();
        command.id = id;
        let guard = self.channel.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(channel) = guard.as_ref() else {
            return Err(DispatchError::Disposed);
        };
        tracing::debug!(%id, target = %command.target, "Submitting work");
        channel.enqueue(command);
        Ok(id)
    }

    pub fn is_ready(&self, id: &RequestId) -> bool {
        self.results.contains_key(id)
    }

    /// Take the stored result. `Ok(None)` means nothing has arrived yet, or
    /// the call returned nothing.
    pub fn fetch(&self, id: &RequestId) -> Result<Option<Value>, DispatchError> {
        self.ensure_live()?;
        match self.results.remove(id) {
            Some((_, result)) => Ok(result.into_value()?),
            None => Ok(None),
        }
    }

    pub fn fetch_as<T: DeserializeOwned>(
        &self,
        id: &RequestId,
    ) -> Result<Option<T>, DispatchError> {
        match self.fetch(id)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Poll until the result for `id` arrives, the worker dies, or `timeout` passes.
    ///
    /// `None` waits forever.
    pub fn wait(
        &self,
        id: &RequestId,
        timeout: Option<Duration>,
    ) -> Result<Option<Value>, DispatchError> {
        let deadline = timeout.map(|t| (t, Instant::now() + t));

        loop {
            // Checked first: an exit may already have torn the channel down.
            if let Some(exit_code) = self.worker_exit() {
                if self.is_ready(id) && !self.is_disposed() {
                    return self.fetch(id);
                }
                tracing::error!(%id, %exit_code, "Worker exited while a call was pending");
                self.shutdown();
                return Err(DispatchError::WorkerCrashed { exit_code });
            }

            self.ensure_live()?;
            if self.is_ready(id) {
                return self.fetch(id);
            }

            if let Some((limit, deadline)) = deadline
                && Instant::now() >= deadline
            {
                tracing::warn!(%id, ?limit, "Timed out waiting for result");
                return Err(DispatchError::Timeout(limit));
            }

            thread::sleep(self.poll_interval);
        }
    }

    /// Submit, wait, and decode. A call that returned nothing decodes from `null`.
    pub fn call<T: DeserializeOwned>(
        &self,
        command: WorkCommand,
        timeout: Option<Duration>,
    ) -> Result<T, DispatchError> {
        let id = self.submit(command)?;
        let value = self.wait(&id, timeout)?.unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)?)
    }

    pub fn call_void(
        &self,
        command: WorkCommand,
        timeout: Option<Duration>,
    ) -> Result<(), DispatchError> {
        let id = self.submit(command)?;
        self.wait(&id, timeout)?;
        Ok(())
    }

    /// Results that arrived but were never fetched.
    pub fn unclaimed(&self) -> usize {
        self.results.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Flush outgoing commands and stop the channel. Later calls are no-ops.
    pub fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let channel = self
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut channel) = channel {
            if self.worker_exit().is_none() {
                channel.wait_for_all_sent();
            }
            channel.shutdown();
            tracing::debug!(session = %channel.names().server, "Dispatcher shut down");
        }
    }

    fn ensure_live(&self) -> Result<(), DispatchError> {
        if self.is_disposed() {
            Err(DispatchError::Disposed)
        } else {
            Ok(())
        }
    }

    fn validate(&self, command: &WorkCommand) -> Result<(), DispatchError> {
        let target = &command.target;
        let Some(handle) = self.resolver.resolve(target, command.arguments.len()) else {
            return Err(DispatchError::InvalidTarget(format!(
                "no method {target} taking {} argument(s)",
                command.arguments.len()
            )));
        };

        if handle.kind() == MethodKind::Instance && self.hosted.as_ref() != Some(&target.type_ref) {
            return Err(DispatchError::InvalidTarget(format!(
                "{target} is an instance method but {} is not the hosted type",
                target.type_ref
            )));
        }
        Ok(())
    }

    fn worker_exit(&self) -> Option<ExitCode> {
        self.probe
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|probe| probe.exit_code())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn store_results(
    inbox: &Inbox<WorkResult>,
    results: &DashMap<RequestId, WorkResult>,
    hooks: &RwLock<Vec<CompletionHook>>,
) {
    while let Some(result) = inbox.pop() {
        let id = result.id;
        tracing::trace!(%id, failed = result.is_failed(), "Result received");
        if results.insert(id, result).is_some() {
            tracing::warn!(%id, "Duplicate result replaced an unclaimed one");
        }

        let hooks: Vec<CompletionHook> = hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for hook in hooks {
            hook(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{IntoArguments, TargetDescriptor};
    use crate::executor::Executor;
    use crate::registry::Registry;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    struct InvalidOperation(String);

    struct Counter(i64);

    fn text() -> TypeRef {
        TypeRef::new("demo", "Text")
    }

    fn counter() -> TypeRef {
        TypeRef::new("demo", "Counter")
    }

    fn registry() -> Arc<Registry> {
        let mut registry = Registry::new();
        registry
            .register_fn(text(), "append", |(p,): (String,)| {
                Ok::<_, Infallible>(format!("Test123{p}"))
            })
            .register_fn(text(), "echo", |(n,): (u64,)| Ok::<_, Infallible>(n))
            .register_fn(text(), "fail", |()| {
                Err::<(), _>(InvalidOperation("Remote Exception!".into()))
            })
            .register_fn(text(), "sleep", |(ms,): (u64,)| {
                thread::sleep(Duration::from_millis(ms));
                Ok::<_, Infallible>(())
            })
            .register_fn(text(), "slow_echo", |(ms, n): (u64, u64)| {
                thread::sleep(Duration::from_millis(ms));
                Ok::<_, Infallible>(n)
            });
        registry
            .register_hosted(counter(), || Counter(1000))
            .method("get", |c: &mut Counter, ()| Ok::<_, Infallible>(c.0))
            .method("set", |c: &mut Counter, (v,): (i64,)| {
                c.0 = v;
                Ok::<_, Infallible>(())
            });
        Arc::new(registry)
    }

    /// Runs an in-process executor against the dispatcher's channel.
    struct LoopbackWorker {
        running: Arc<AtomicBool>,
        handle: Option<thread::JoinHandle<()>>,
    }

    impl LoopbackWorker {
        fn start(names: &ChannelNames, registry: Arc<Registry>, hosted: Option<TypeRef>) -> Self {
            let config = ChannelConfig::default();
            let channel =
                DuplexChannel::<WorkResult, WorkCommand>::worker(names, &config, None).unwrap();
            let running = Arc::new(AtomicBool::new(true));
            let handle = thread::spawn({
                let running = running.clone();
                move || {
                    let mut executor = Executor::new(registry, hosted);
                    executor.run(&channel, &running, Duration::from_millis(1));
                    channel.wait_for_all_sent();
                }
            });
            Self {
                running,
                handle: Some(handle),
            }
        }
    }

    impl Drop for LoopbackWorker {
        fn drop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    struct ExitedProbe;

    impl WorkerProbe for ExitedProbe {
        fn exit_code(&self) -> Option<ExitCode> {
            Some(ExitCode::ErrorCrash)
        }
    }

    fn setup(hosted: Option<TypeRef>) -> (Dispatcher, LoopbackWorker) {
        let names = ChannelNames::for_session(&format!("disp_{}", uuid::Uuid::new_v4().simple()));
        let registry = registry();
        let dispatcher =
            Dispatcher::connect(&names, &ChannelConfig::default(), registry.clone(), hosted.clone())
                .unwrap();
        let worker = LoopbackWorker::start(&names, registry, hosted);
        (dispatcher, worker)
    }

    fn command(type_ref: TypeRef, method: &str, args: impl IntoArguments) -> WorkCommand {
        WorkCommand::new(TargetDescriptor::new(type_ref, method), args).unwrap()
    }

    const WAIT: Option<Duration> = Some(Duration::from_secs(10));

    #[test]
    fn call_returns_remote_value() {
        let (dispatcher, _worker) = setup(None);
        let out: String = dispatcher
            .call(command(text(), "append", ("1",)), WAIT)
            .unwrap();
        assert_eq!(out, "Test1231");
    }

    #[test]
    fn results_correlate_by_id() {
        let (dispatcher, _worker) = setup(None);
        let ids: Vec<(u64, RequestId)> = (0..50)
            .map(|n| (n, dispatcher.submit(command(text(), "echo", (n,))).unwrap()))
            .collect();

        for (n, id) in ids.into_iter().rev() {
            let value = dispatcher.wait(&id, WAIT).unwrap();
            assert_eq!(value, Some(serde_json::json!(n)));
        }
        assert_eq!(dispatcher.unclaimed(), 0);
    }

    #[test]
    fn resubmitted_command_gets_fresh_id() {
        let (dispatcher, _worker) = setup(None);
        let cmd = command(text(), "echo", (5u64,));

        let first = dispatcher.submit(cmd.clone()).unwrap();
        let second = dispatcher.submit(cmd.clone()).unwrap();
        assert_ne!(first, second);
        assert_ne!(first, cmd.id);

        assert_eq!(dispatcher.wait(&first, WAIT).unwrap(), Some(serde_json::json!(5)));
        assert_eq!(dispatcher.wait(&second, WAIT).unwrap(), Some(serde_json::json!(5)));
        assert_eq!(dispatcher.unclaimed(), 0);
    }

    #[test]
    fn late_result_is_fetchable_after_timeout() {
        let (dispatcher, _worker) = setup(None);
        let id = dispatcher
            .submit(command(text(), "slow_echo", (200u64, 42u64)))
            .unwrap();

        let err = dispatcher
            .wait(&id, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout(_)));

        assert_eq!(dispatcher.wait(&id, WAIT).unwrap(), Some(serde_json::json!(42)));
    }

    #[test]
    fn fetch_removes_result() {
        let (dispatcher, _worker) = setup(None);
        let id = dispatcher.submit(command(text(), "echo", (7u64,))).unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while !dispatcher.is_ready(&id) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(dispatcher.is_ready(&id));
        assert_eq!(dispatcher.fetch_as::<u64>(&id).unwrap(), Some(7));
        assert!(!dispatcher.is_ready(&id));
        assert_eq!(dispatcher.fetch(&id).unwrap(), None);
    }

    #[test]
    fn remote_error_is_surfaced() {
        let (dispatcher, _worker) = setup(None);
        let err = dispatcher
            .call_void(command(text(), "fail", ()), WAIT)
            .unwrap_err();
        match err {
            DispatchError::Remote(remote) => {
                assert_eq!(remote.kind, "InvalidOperation");
                assert_eq!(remote.message, "Remote Exception!");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[test]
    fn invalid_target_is_rejected_locally() {
        let (dispatcher, _worker) = setup(None);
        let sent = Arc::new(AtomicUsize::new(0));
        dispatcher.on_work_complete({
            let sent = sent.clone();
            move |_| {
                sent.fetch_add(1, Ordering::SeqCst);
            }
        });

        let missing = dispatcher.submit(command(text(), "nope", ()));
        assert!(matches!(missing, Err(DispatchError::InvalidTarget(_))));

        let arity = dispatcher.submit(command(text(), "append", ("a", "b")));
        assert!(matches!(arity, Err(DispatchError::InvalidTarget(_))));

        thread::sleep(Duration::from_millis(50));
        assert_eq!(sent.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.unclaimed(), 0);
    }

    #[test]
    fn instance_method_requires_hosted_type() {
        let (dispatcher, _worker) = setup(None);
        let err = dispatcher.submit(command(counter(), "get", ())).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTarget(_)));
    }

    #[test]
    fn hosted_state_persists_across_calls() {
        let (dispatcher, _worker) = setup(Some(counter()));
        let start: i64 = dispatcher.call(command(counter(), "get", ()), WAIT).unwrap();
        assert_eq!(start, 1000);

        dispatcher
            .call_void(command(counter(), "set", (5000,)), WAIT)
            .unwrap();
        let now: i64 = dispatcher.call(command(counter(), "get", ()), WAIT).unwrap();
        assert_eq!(now, 5000);
    }

    #[test]
    fn wait_times_out() {
        let (dispatcher, _worker) = setup(None);
        let id = dispatcher.submit(command(text(), "sleep", (2000u64,))).unwrap();
        let err = dispatcher
            .wait(&id, Some(Duration::from_millis(100)))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout(_)));
    }

    #[test]
    fn exited_worker_fails_pending_wait() {
        let names = ChannelNames::for_session(&format!("disp_{}", uuid::Uuid::new_v4().simple()));
        let dispatcher =
            Dispatcher::connect(&names, &ChannelConfig::default(), registry(), None).unwrap();
        dispatcher.set_probe(Arc::new(ExitedProbe));

        let id = dispatcher.submit(command(text(), "echo", (1u64,))).unwrap();
        let started = Instant::now();
        let err = dispatcher.wait(&id, None).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::WorkerCrashed {
                exit_code: ExitCode::ErrorCrash
            }
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(dispatcher.is_disposed());
    }

    #[test]
    fn completion_hook_fires() {
        let (dispatcher, _worker) = setup(None);
        let (tx, rx) = std::sync::mpsc::channel();
        dispatcher.on_work_complete(move |id| {
            let _ = tx.send(id);
        });

        let id = dispatcher.submit(command(text(), "echo", (3u64,))).unwrap();
        let notified = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(notified, id);
    }

    #[test]
    fn shutdown_is_idempotent_and_final() {
        let (dispatcher, _worker) = setup(None);
        dispatcher.shutdown();
        dispatcher.shutdown();
        assert!(matches!(
            dispatcher.submit(command(text(), "echo", (1u64,))),
            Err(DispatchError::Disposed)
        ));
        assert!(matches!(
            dispatcher.fetch(&RequestId::new()),
            Err(DispatchError::Disposed)
        ));
    }
}
