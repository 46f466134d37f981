//! Bidirectional message channel over two mailboxes.
//!
//! Each direction is one mailbox plus two events: `ready` (writer → reader,
//! "a message is in the mailbox") and `ack` (reader → writer, "taken").
//! Both directions are pumped by background threads so `enqueue` never
//! blocks on the peer.
//!
//! # Naming
//!
//! For a session `S` the host sends on `S_Server` and receives on `S_Client`;
//! the worker does the reverse. Each mailbox name `M` owns `M_mutex`,
//! `M_ready` and `M_ack`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};

use crate::mailbox::Mailbox;
use crate::shm::{NamedEvent, ShmError};

mod receiver;
mod sender;

pub use receiver::{Inbox, MessageHandler, Receiver};
pub use sender::Sender;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to set up '{name}': {source}")]
    Shm {
        name: String,
        #[source]
        source: ShmError,
    },

    #[error("failed to start pump thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// Timing knobs shared by both pumps.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub initial_capacity: usize,
    pub poll_interval: Duration,
    pub ack_timeout: Duration,
    pub lock_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 4096,
            poll_interval: Duration::from_millis(1),
            ack_timeout: Duration::from_millis(1000),
            lock_timeout: Duration::from_millis(50),
        }
    }
}

impl ChannelConfig {
    pub fn with_initial_capacity(mut self, bytes: usize) -> Self {
        self.initial_capacity = bytes;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

/// Mailbox names for both directions of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    /// Host → worker.
    pub server: String,
    /// Worker → host.
    pub client: String,
}

impl ChannelNames {
    pub fn new(server: impl Into<String>, client: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            client: client.into(),
        }
    }

    pub fn for_session(session: &str) -> Self {
        Self::new(format!("{session}_Server"), format!("{session}_Client"))
    }
}

/// Which side of the channel this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates every named object and unlinks them on drop.
    Host,
    /// Opens objects the host created.
    Worker,
}

/// The named objects for one direction.
pub(crate) struct Endpoint {
    pub mailbox: Mailbox,
    pub ready: NamedEvent,
    pub ack: NamedEvent,
}

impl Endpoint {
    fn setup(name: &str, role: Role, config: &ChannelConfig) -> Result<Self, ChannelError> {
        let ready_name = format!("{name}_ready");
        let ack_name = format!("{name}_ack");

        let endpoint = match role {
            Role::Host => Self {
                mailbox: Mailbox::create(name, config.initial_capacity, config.lock_timeout)
                    .map_err(shm_error(name))?,
                ready: NamedEvent::create(&ready_name).map_err(shm_error(&ready_name))?,
                ack: NamedEvent::create(&ack_name).map_err(shm_error(&ack_name))?,
            },
            Role::Worker => Self {
                mailbox: Mailbox::open(name, config.lock_timeout).map_err(shm_error(name))?,
                ready: NamedEvent::open(&ready_name).map_err(shm_error(&ready_name))?,
                ack: NamedEvent::open(&ack_name).map_err(shm_error(&ack_name))?,
            },
        };
        Ok(endpoint)
    }
}

fn shm_error(name: &str) -> impl FnOnce(ShmError) -> ChannelError + use<> {
    let name = name.to_string();
    move |source| ChannelError::Shm { name, source }
}

/// A sender and a receiver bound to one session.
pub struct DuplexChannel<Out, In> {
    names: ChannelNames,
    role: Role,
    sender: Sender<Out>,
    receiver: Receiver<In>,
}

impl<Out, In> DuplexChannel<Out, In>
where
    Out: Serialize + Send + 'static,
    In: DeserializeOwned + Send + 'static,
{
    /// Create all named objects and start both pumps.
    pub fn host(
        names: &ChannelNames,
        config: &ChannelConfig,
        handler: Option<MessageHandler<In>>,
    ) -> Result<Self, ChannelError> {
        Self::start(names, Role::Host, config, handler)
    }

    /// Open the host's objects and start both pumps.
    pub fn worker(
        names: &ChannelNames,
        config: &ChannelConfig,
        handler: Option<MessageHandler<In>>,
    ) -> Result<Self, ChannelError> {
        Self::start(names, Role::Worker, config, handler)
    }

    fn start(
        names: &ChannelNames,
        role: Role,
        config: &ChannelConfig,
        handler: Option<MessageHandler<In>>,
    ) -> Result<Self, ChannelError> {
        let (outgoing, incoming) = match role {
            Role::Host => (&names.server, &names.client),
            Role::Worker => (&names.client, &names.server),
        };

        let out_endpoint = Endpoint::setup(outgoing, role, config)?;
        let in_endpoint = Endpoint::setup(incoming, role, config)?;

        let sender = Sender::start(outgoing, out_endpoint, config.clone())?;
        let receiver = Receiver::start(incoming, in_endpoint, config.clone(), handler)?;

        tracing::debug!(
            ?role,
            sends_on = %outgoing,
            receives_on = %incoming,
            "Channel started"
        );

        Ok(Self {
            names: names.clone(),
            role,
            sender,
            receiver,
        })
    }

    pub fn enqueue(&self, message: Out) {
        self.sender.enqueue(message);
    }

    pub fn try_recv(&self) -> Option<In> {
        self.receiver.inbox().pop()
    }

    pub fn inbox(&self) -> &Arc<Inbox<In>> {
        self.receiver.inbox()
    }

    /// Block until every enqueued message has been written out.
    pub fn wait_for_all_sent(&self) {
        self.sender.wait_for_all_sent();
    }

    pub fn names(&self) -> &ChannelNames {
        &self.names
    }

    /// Stop both pumps. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.sender.shutdown();
        self.receiver.shutdown();
    }
}

impl<Out, In> std::fmt::Debug for DuplexChannel<Out, In> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexChannel")
            .field("names", &self.names)
            .field("role", &self.role)
            .finish()
    }
}
