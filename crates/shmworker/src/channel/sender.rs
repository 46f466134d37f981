//! Outgoing half: a local FIFO drained into the mailbox by a pump thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use serde::Serialize;

use super::{ChannelConfig, Endpoint};
use crate::bridge::codec::JsonCodec;

type Queue<T> = Arc<Mutex<VecDeque<T>>>;

pub struct Sender<T> {
    name: String,
    queue: Queue<T>,
    running: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
    config: ChannelConfig,
}

impl<T: Serialize + Send + 'static> Sender<T> {
    pub(crate) fn start(
        name: &str,
        endpoint: Endpoint,
        config: ChannelConfig,
    ) -> std::io::Result<Self> {
        let queue: Queue<T> = Arc::new(Mutex::new(VecDeque::new()));
        let running = Arc::new(AtomicBool::new(true));

        let pump = thread::Builder::new().name(format!("send-{name}")).spawn({
            let queue = queue.clone();
            let running = running.clone();
            let config = config.clone();
            move || pump(endpoint, queue, running, config)
        })?;

        Ok(Self {
            name: name.to_string(),
            queue,
            running,
            pump: Some(pump),
            config,
        })
    }

    pub fn enqueue(&self, message: T) {
        lock(&self.queue).push_back(message);
    }

    pub(crate) fn pending(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Busy-wait until the queue drains or the pump stops.
    pub fn wait_for_all_sent(&self) {
        while self.running.load(Ordering::Acquire) && self.pending() > 0 {
            thread::sleep(self.config.poll_interval);
        }
    }

    /// Stop the pump and discard anything still queued.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(pump) = self.pump.take() {
            if pump.join().is_err() {
                tracing::error!(mailbox = %self.name, "Send pump panicked");
            }
            let dropped = {
                let mut queue = lock(&self.queue);
                let dropped = queue.len();
                queue.clear();
                dropped
            };
            if dropped > 0 {
                tracing::debug!(mailbox = %self.name, dropped, "Unsent messages discarded");
            }
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}

fn pump<T: Serialize>(
    mut endpoint: Endpoint,
    queue: Queue<T>,
    running: Arc<AtomicBool>,
    config: ChannelConfig,
) {
    let codec = JsonCodec::<T>::new();

    while running.load(Ordering::Acquire) {
        // Peek, don't pop: a failed write leaves the message at the head.
        let head = lock(&queue).front().map(|message| codec.encode(message));

        match head {
            Some(Ok(bytes)) => {
                if endpoint.mailbox.write(&bytes) {
                    endpoint.ready.set();
                    lock(&queue).pop_front();
                    if !wait_for_ack(&endpoint, &running, &config) {
                        tracing::debug!(
                            mailbox = %endpoint.mailbox.name(),
                            "No acknowledgement before timeout"
                        );
                    }
                }
            }
            Some(Err(e)) => {
                tracing::error!(
                    mailbox = %endpoint.mailbox.name(),
                    error = %e,
                    "Dropping message that cannot be encoded"
                );
                lock(&queue).pop_front();
            }
            None => {}
        }

        thread::sleep(config.poll_interval);
    }
}

fn wait_for_ack(endpoint: &Endpoint, running: &AtomicBool, config: &ChannelConfig) -> bool {
    let deadline = Instant::now() + config.ack_timeout;
    while running.load(Ordering::Acquire) {
        if endpoint.ack.wait(config.poll_interval) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
    }
    false
}

fn lock<T>(queue: &Mutex<VecDeque<T>>) -> MutexGuard<'_, VecDeque<T>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}
