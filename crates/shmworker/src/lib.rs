//! shmworker: run functions in a separate worker process.
//!
//! The host and the worker exchange JSON messages through a pair of shared
//! memory mailboxes. The host validates each command against its own
//! [`MethodResolver`], sends it, and correlates the result by [`RequestId`].
//! The worker serves commands one at a time, optionally against a single
//! hosted instance that lives as long as the worker.

pub mod bridge;
pub mod channel;
pub mod client;
pub mod demo;
pub mod dispatcher;
pub mod executor;
pub mod logging;
pub mod mailbox;
pub mod process;
pub mod registry;
pub mod shm;
pub mod supervisor;
pub mod worker;

pub use bridge::protocol::{
    IntoArguments, Outcome, RemoteError, RequestId, TargetDescriptor, TypeRef, WorkCommand,
    WorkResult,
};
pub use channel::{ChannelConfig, ChannelNames, DuplexChannel};
pub use client::{ProcessWorker, WorkerConfig, WorkerError, run_and_wait};
pub use dispatcher::{DispatchError, Dispatcher, WorkerProbe};
pub use executor::Executor;
pub use mailbox::Mailbox;
pub use process::{ExitCode, ProcessArguments};
pub use registry::{MethodKind, MethodResolver, Registry};
pub use supervisor::{ExecutableSpawner, SpawnError, WorkerProcess, WorkerSpawner};
pub use worker::{run_with_arguments, run_worker};
