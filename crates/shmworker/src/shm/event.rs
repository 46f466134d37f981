//! Named auto-reset event.

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use super::{Result, ShmSegment};

const EVENT_SEGMENT_LEN: usize = 64;
const WAIT_SLICE: Duration = Duration::from_micros(100);

/// A signalled flag shared between processes.
///
/// [`wait`](NamedEvent::wait) consumes the signal, so one `set` releases at
/// most one waiter.
pub struct NamedEvent {
    segment: ShmSegment,
}

impl NamedEvent {
    pub fn create(name: &str) -> Result<Self> {
        Ok(Self {
            segment: ShmSegment::create(name, EVENT_SEGMENT_LEN)?,
        })
    }

    pub fn open(name: &str) -> Result<Self> {
        Ok(Self {
            segment: ShmSegment::open(name)?,
        })
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    pub fn set(&self) {
        self.flag().store(1, Ordering::Release);
    }

    pub fn reset(&self) {
        self.flag().store(0, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.flag().load(Ordering::Acquire) == 1
    }

    /// Wait up to `timeout` for the event. Returns `true` if it was signalled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let flag = self.flag();
        let started = Instant::now();
        loop {
            if flag
                .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
            if started.elapsed() >= timeout {
                return false;
            }
            thread::sleep(WAIT_SLICE);
        }
    }

    fn flag(&self) -> &AtomicU32 {
        // SAFETY: the segment is page aligned, at least EVENT_SEGMENT_LEN bytes,
        // and lives as long as `self`.
        unsafe { &*(self.segment.as_ptr() as *const AtomicU32) }
    }
}

impl std::fmt::Debug for NamedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedEvent")
            .field("name", &self.segment.name())
            .field("set", &self.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique() -> String {
        format!("evt_{}", uuid::Uuid::new_v4().simple())
    }

    #[test]
    fn wait_consumes_signal() {
        let name = unique();
        let owner = NamedEvent::create(&name).unwrap();
        let peer = NamedEvent::open(&name).unwrap();

        assert!(!peer.is_set());
        owner.set();
        assert!(peer.wait(Duration::from_millis(10)));
        assert!(!peer.wait(Duration::from_millis(5)));
    }

    #[test]
    fn wait_times_out() {
        let event = NamedEvent::create(&unique()).unwrap();
        let started = Instant::now();
        assert!(!event.wait(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn set_from_other_thread_wakes_waiter() {
        let name = unique();
        let owner = NamedEvent::create(&name).unwrap();
        let peer = NamedEvent::open(&name).unwrap();

        let waiter = thread::spawn(move || peer.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(10));
        owner.set();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn reset_clears_pending_signal() {
        let event = NamedEvent::create(&unique()).unwrap();
        event.set();
        event.reset();
        assert!(!event.wait(Duration::ZERO));
    }
}
