//! Named cross-process mutex.
//!
//! The lock is a single `AtomicU32` at the start of its own segment holding
//! the pid of the current holder, or zero when free. A holder that died
//! without unlocking is detected by pid and its lock is taken over.

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use super::{Result, ShmSegment, pid_alive};

const LOCK_SEGMENT_LEN: usize = 64;
const SPIN_SLEEP: Duration = Duration::from_micros(50);

pub struct NamedMutex {
    segment: ShmSegment,
    pid: u32,
}

impl NamedMutex {
    pub fn create(name: &str) -> Result<Self> {
        Ok(Self {
            segment: ShmSegment::create(name, LOCK_SEGMENT_LEN)?,
            pid: std::process::id(),
        })
    }

    pub fn open(name: &str) -> Result<Self> {
        Ok(Self {
            segment: ShmSegment::open(name)?,
            pid: std::process::id(),
        })
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Try to acquire the lock, giving up after `timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<NamedMutexGuard<'_>> {
        let word = self.word();
        let started = Instant::now();

        loop {
            match word.compare_exchange(0, self.pid, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return Some(NamedMutexGuard { word, pid: self.pid }),
                Err(holder) if holder != self.pid && !pid_alive(holder) => {
                    if word
                        .compare_exchange(holder, self.pid, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                    {
                        tracing::warn!(
                            mutex = %self.segment.name(),
                            holder,
                            "Recovered lock abandoned by dead process"
                        );
                        return Some(NamedMutexGuard { word, pid: self.pid });
                    }
                }
                Err(_) => {}
            }

            if started.elapsed() >= timeout {
                return None;
            }
            thread::sleep(SPIN_SLEEP);
        }
    }

    fn word(&self) -> &AtomicU32 {
        // SAFETY: the segment is at least LOCK_SEGMENT_LEN bytes, page aligned,
        // and lives as long as `self`.
        unsafe { &*(self.segment.as_ptr() as *const AtomicU32) }
    }
}

impl std::fmt::Debug for NamedMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedMutex")
            .field("name", &self.segment.name())
            .finish()
    }
}

/// Releases the lock on drop.
pub struct NamedMutexGuard<'a> {
    word: &'a AtomicU32,
    pid: u32,
}

impl Drop for NamedMutexGuard<'_> {
    fn drop(&mut self) {
        // Only clear the word if nobody took the lock over in the meantime.
        let _ = self
            .word
            .compare_exchange(self.pid, 0, Ordering::Release, Ordering::Relaxed);
    }
}
