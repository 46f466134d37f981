//! Incoming half: a pump thread that moves mailbox contents into an [`Inbox`].

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use serde::de::DeserializeOwned;

use super::{ChannelConfig, Endpoint};
use crate::bridge::codec::JsonCodec;

/// Called on the pump thread after each message lands in the inbox.
pub type MessageHandler<T> = Arc<dyn Fn(&Inbox<T>) + Send + Sync>;

/// Received messages in arrival order.
pub struct Inbox<T> {
    queue: Mutex<VecDeque<T>>,
}

impl<T> Inbox<T> {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    fn push(&self, message: T) {
        self.lock().push_back(message);
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Receiver<T> {
    name: String,
    inbox: Arc<Inbox<T>>,
    running: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

impl<T: DeserializeOwned + Send + 'static> Receiver<T> {
    pub(crate) fn start(
        name: &str,
        endpoint: Endpoint,
        config: ChannelConfig,
        handler: Option<MessageHandler<T>>,
    ) -> std::io::Result<Self> {
        let inbox = Arc::new(Inbox::new());
        let running = Arc::new(AtomicBool::new(true));

        let pump = thread::Builder::new().name(format!("recv-{name}")).spawn({
            let inbox = inbox.clone();
            let running = running.clone();
            move || pump(endpoint, inbox, running, config, handler)
        })?;

        Ok(Self {
            name: name.to_string(),
            inbox,
            running,
            pump: Some(pump),
        })
    }
}

impl<T> Receiver<T> {
    pub fn inbox(&self) -> &Arc<Inbox<T>> {
        &self.inbox
    }

    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(pump) = self.pump.take()
            && pump.join().is_err()
        {
            tracing::error!(mailbox = %self.name, "Receive pump panicked");
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}

fn pump<T: DeserializeOwned>(
    mut endpoint: Endpoint,
    inbox: Arc<Inbox<T>>,
    running: Arc<AtomicBool>,
    config: ChannelConfig,
    handler: Option<MessageHandler<T>>,
) {
    let codec = JsonCodec::<T>::new();

    while running.load(Ordering::Acquire) {
        if !endpoint.ready.wait(config.poll_interval) {
            continue;
        }

        if let Some(message) = endpoint.mailbox.receive(&codec) {
            inbox.push(message);
            if let Some(handler) = &handler
                && catch_unwind(AssertUnwindSafe(|| handler(inbox.as_ref()))).is_err()
            {
                tracing::error!(mailbox = %endpoint.mailbox.name(), "Message handler panicked");
            }
        }

        // Ack even when decoding failed so the writer moves on.
        endpoint.ack.set();
    }
}
