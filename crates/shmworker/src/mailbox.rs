//! Single-slot shared memory mailbox.
//!
//! A mailbox is a growable region plus a named lock. Writes replace the whole
//! contents and zero the tail; reads return everything up to the last
//! non-NUL byte. The region only ever grows, and always keeps room for twice
//! the payload being written.

use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};

use crate::bridge::codec::{CodecError, JsonCodec, trim_padding};
use crate::shm::{NamedMutex, Result, ShmSegment};

pub struct Mailbox {
    region: ShmSegment,
    lock: NamedMutex,
    lock_timeout: Duration,
}

impl Mailbox {
    /// Create the region and its lock. Called by the side that owns the names.
    pub fn create(name: &str, initial_capacity: usize, lock_timeout: Duration) -> Result<Self> {
        let lock = NamedMutex::create(&lock_name(name))?;
        let region = ShmSegment::create(name, initial_capacity)?;
        tracing::debug!(mailbox = name, capacity = region.len(), "Created mailbox");
        Ok(Self {
            region,
            lock,
            lock_timeout,
        })
    }

    pub fn open(name: &str, lock_timeout: Duration) -> Result<Self> {
        let lock = NamedMutex::open(&lock_name(name))?;
        let region = ShmSegment::open(name)?;
        tracing::debug!(mailbox = name, capacity = region.len(), "Opened mailbox");
        Ok(Self {
            region,
            lock,
            lock_timeout,
        })
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    /// Current region size as last observed by this handle.
    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    /// Replace the mailbox contents with `payload`.
    ///
    /// Returns `false` without writing if the lock could not be taken in time
    /// or the region could not be grown.
    pub fn write(&mut self, payload: &[u8]) -> bool {
        let Some(_guard) = self.lock.try_lock_for(self.lock_timeout) else {
            tracing::trace!(mailbox = %self.region.name(), "Mailbox busy, write skipped");
            return false;
        };

        if let Err(e) = self.region.refresh() {
            tracing::warn!(mailbox = %self.region.name(), error = %e, "Failed to refresh mailbox");
            return false;
        }

        let wanted = payload.len().saturating_mul(2);
        if self.region.len() < wanted {
            if let Err(e) = self.region.resize(wanted) {
                tracing::warn!(
                    mailbox = %self.region.name(),
                    requested = wanted,
                    error = %e,
                    "Failed to grow mailbox"
                );
                return false;
            }
            tracing::debug!(
                mailbox = %self.region.name(),
                capacity = wanted,
                payload_len = payload.len(),
                "Grew mailbox"
            );
        }

        self.region.write_padded(payload);
        true
    }

    /// Snapshot of the contents with trailing padding removed.
    pub fn read(&mut self) -> Option<Vec<u8>> {
        let Some(_guard) = self.lock.try_lock_for(self.lock_timeout) else {
            tracing::trace!(mailbox = %self.region.name(), "Mailbox busy, read skipped");
            return None;
        };

        if let Err(e) = self.region.refresh() {
            tracing::warn!(mailbox = %self.region.name(), error = %e, "Failed to refresh mailbox");
            return None;
        }

        let mut bytes = self.region.read_all();
        let len = trim_padding(&bytes).len();
        bytes.truncate(len);
        Some(bytes)
    }

    /// Encode and write a message. Encoding failures are logged.
    pub fn send<T: Serialize>(&mut self, codec: &JsonCodec<T>, message: &T) -> bool {
        match codec.encode(message) {
            Ok(bytes) => self.write(&bytes),
            Err(e) => {
                tracing::error!(
                    mailbox = %self.region.name(),
                    error = %e,
                    "Failed to encode message"
                );
                false
            }
        }
    }

    /// Read and decode a message. Decoding failures are logged and yield `None`.
    pub fn receive<T: DeserializeOwned>(&mut self, codec: &JsonCodec<T>) -> Option<T> {
        let bytes = self.read()?;
        match codec.decode(&bytes) {
            Ok(message) => Some(message),
            Err(CodecError::Empty) => None,
            Err(e) => {
                tracing::error!(
                    mailbox = %self.region.name(),
                    error = %e,
                    "Failed to decode message"
                );
                None
            }
        }
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("name", &self.region.name())
            .field("capacity", &self.region.len())
            .finish()
    }
}

fn lock_name(mailbox: &str) -> String {
    format!("{mailbox}_mutex")
}
