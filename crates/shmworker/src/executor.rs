//! Worker-side command execution.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::bridge::protocol::{RemoteError, TypeRef, WorkCommand, WorkResult};
use crate::channel::DuplexChannel;
use crate::registry::{HostedInstance, MethodKind, MethodResolver};

/// Runs commands one at a time, in arrival order.
///
/// Failures of any kind become a failed [`WorkResult`]; nothing a target does
/// can stop the loop.
pub struct Executor {
    resolver: Arc<dyn MethodResolver>,
    hosted_type: Option<TypeRef>,
    hosted: Option<HostedInstance>,
}

impl Executor {
    pub fn new(resolver: Arc<dyn MethodResolver>, hosted_type: Option<TypeRef>) -> Self {
        Self {
            resolver,
            hosted_type,
            hosted: None,
        }
    }

    /// Whether the hosted instance has been constructed yet.
    pub fn has_instance(&self) -> bool {
        self.hosted.is_some()
    }

    pub fn execute(&mut self, command: WorkCommand) -> WorkResult {
        let id = command.id;
        let target = command.target.to_string();

        let outcome = catch_unwind(AssertUnwindSafe(|| self.invoke(command)));
        match outcome {
            Ok(Ok(value)) => {
                tracing::trace!(%id, %target, "Work completed");
                WorkResult::returned(id, (!value.is_null()).then_some(value))
            }
            Ok(Err(error)) => {
                tracing::debug!(%id, %target, error = %error, "Work failed");
                WorkResult::failed(id, error)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(%id, %target, %message, "Target panicked");
                WorkResult::failed(id, RemoteError::new("panic", message))
            }
        }
    }

    /// Drain the channel until `running` is cleared.
    pub fn run(
        &mut self,
        channel: &DuplexChannel<WorkResult, WorkCommand>,
        running: &AtomicBool,
        poll_interval: Duration,
    ) {
        while running.load(Ordering::Acquire) {
            match channel.try_recv() {
                Some(command) => {
                    let result = self.execute(command);
                    channel.enqueue(result);
                }
                None => thread::sleep(poll_interval),
            }
        }
    }

    fn invoke(&mut self, command: WorkCommand) -> Result<serde_json::Value, RemoteError> {
        let WorkCommand {
            target, arguments, ..
        } = command;

        let Some(handle) = self.resolver.resolve(&target, arguments.len()) else {
            return Err(RemoteError::new(
                "MethodNotFound",
                format!("no method {target} taking {} argument(s)", arguments.len()),
            ));
        };

        let resolver = self.resolver.clone();
        match handle.kind() {
            MethodKind::Static => resolver.invoke(&handle, arguments, None),
            MethodKind::Instance => {
                let instance = self.instance_for(&target.type_ref)?;
                resolver.invoke(&handle, arguments, Some(instance))
            }
        }
    }

    /// The hosted instance, constructed on first use.
    fn instance_for(&mut self, type_ref: &TypeRef) -> Result<&mut HostedInstance, RemoteError> {
        if self.hosted_type.as_ref() != Some(type_ref) {
            return Err(RemoteError::new(
                "NotHosted",
                format!("{type_ref} is not the hosted type of this worker"),
            ));
        }

        if self.hosted.is_none() {
            let Some(instance) = self.resolver.create_instance(type_ref) else {
                return Err(RemoteError::new(
                    "NotHostable",
                    format!("no constructor registered for {type_ref}"),
                ));
            };
            tracing::info!(hosted = %type_ref, "Created hosted instance");
            self.hosted = Some(instance);
        }

        self.hosted.as_mut().ok_or_else(|| {
            RemoteError::new("NotHostable", format!("no instance of {type_ref}"))
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{IntoArguments, Outcome, TargetDescriptor};
    use crate::registry::Registry;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;

    static CONSTRUCTED: AtomicUsize = AtomicUsize::new(0);

    struct Counter(i64);

    fn text() -> TypeRef {
        TypeRef::new("demo", "Text")
    }

    fn counter() -> TypeRef {
        TypeRef::new("demo", "Counter")
    }

    fn executor(hosted: Option<TypeRef>) -> Executor {
        let mut registry = Registry::new();
        registry
            .register_fn(text(), "append", |(p,): (String,)| {
                Ok::<_, Infallible>(format!("Test123{p}"))
            })
            .register_fn(text(), "noop", |()| Ok::<_, Infallible>(()))
            .register_fn(text(), "explode", |()| -> Result<(), Infallible> {
                panic!("kaboom")
            });
        registry
            .register_hosted(counter(), || {
                CONSTRUCTED.fetch_add(1, Ordering::SeqCst);
                Counter(1000)
            })
            .method("bump", |c: &mut Counter, ()| {
                c.0 += 1;
                Ok::<_, Infallible>(c.0)
            });
        Executor::new(Arc::new(registry), hosted)
    }

    fn command(type_ref: TypeRef, method: &str, args: impl IntoArguments) -> WorkCommand {
        WorkCommand::new(TargetDescriptor::new(type_ref, method), args).unwrap()
    }

    fn error_kind(result: &WorkResult) -> &str {
        match &result.outcome {
            Outcome::Failed { error } => &error.kind,
            Outcome::Returned { .. } => panic!("expected failure, got {result:?}"),
        }
    }

    #[test]
    fn returns_value_under_command_id() {
        let mut executor = executor(None);
        let cmd = command(text(), "append", ("1",));
        let id = cmd.id;
        let result = executor.execute(cmd);
        assert_eq!(result.id, id);
        assert_eq!(
            result.outcome,
            Outcome::Returned {
                value: Some(serde_json::json!("Test1231"))
            }
        );
    }

    #[test]
    fn unit_return_has_no_value() {
        let mut executor = executor(None);
        let result = executor.execute(command(text(), "noop", ()));
        assert_eq!(result.outcome, Outcome::Returned { value: None });
    }

    #[test]
    fn unknown_method_is_a_failed_result() {
        let mut executor = executor(None);
        let result = executor.execute(command(text(), "missing", ()));
        assert_eq!(error_kind(&result), "MethodNotFound");
    }

    #[test]
    fn panic_is_contained() {
        let mut executor = executor(None);
        let result = executor.execute(command(text(), "explode", ()));
        assert_eq!(error_kind(&result), "panic");

        let after = executor.execute(command(text(), "append", ("2",)));
        assert!(!after.is_failed());
    }

    #[test]
    fn hosted_instance_is_created_lazily_once() {
        let mut executor = executor(Some(counter()));
        assert!(!executor.has_instance());

        let before = CONSTRUCTED.load(Ordering::SeqCst);
        let first = executor.execute(command(counter(), "bump", ()));
        let second = executor.execute(command(counter(), "bump", ()));
        assert!(executor.has_instance());
        assert_eq!(CONSTRUCTED.load(Ordering::SeqCst), before + 1);

        assert_eq!(first.into_value().unwrap(), Some(serde_json::json!(1001)));
        assert_eq!(second.into_value().unwrap(), Some(serde_json::json!(1002)));
    }

    #[test]
    fn instance_call_without_hosting_fails() {
        let mut executor = executor(None);
        let result = executor.execute(command(counter(), "bump", ()));
        assert_eq!(error_kind(&result), "NotHosted");
        assert!(!executor.has_instance());
    }
}
