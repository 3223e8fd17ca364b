//! Bounded single-producer/single-consumer ring carrying pages the refresher
//! found evicted back to a dedicated I/O thread, so a page-in never blocks
//! the refresh cycle.
//!
//! The spec describes a hand-rolled spinlock-guarded ring plus a
//! mutex/condvar wakeup pair. `crossbeam_queue::ArrayQueue` already gives a
//! lock-free bounded ring with exactly the "push what fits, drop the rest"
//! semantics the spec calls for, so it stands in for the spinlock half; the
//! wakeup half is still a plain `parking_lot` mutex/condvar, which is what
//! the spec asks for verbatim.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};

/// A mapped page address. Stored as a bare integer so the queue stays
/// `Send`/`Sync` without an unsafe impl of its own; the producer and
/// consumer both know these came from mappings that outlive the ring (the
/// keeper drains and joins the rewarmer before unmapping anything).
pub type PageAddr = usize;

struct Wakeup {
    mutex: Mutex<()>,
    condvar: Condvar,
    quit: AtomicBool,
}

pub struct RewarmRing {
    queue: ArrayQueue<PageAddr>,
    wakeup: Wakeup,
}

impl RewarmRing {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(RewarmRing {
            queue: ArrayQueue::new(capacity.max(1)),
            wakeup: Wakeup {
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
                quit: AtomicBool::new(false),
            },
        })
    }

    /// Enqueues as many of `pages` as fit; extras are silently dropped, per
    /// spec ("when the ring is full, extra pages are dropped, not queued").
    /// Wakes the consumer if the ring was empty before this call.
    pub fn offer(&self, pages: &[PageAddr]) {
        let was_empty = self.queue.is_empty();
        for &p in pages {
            if self.queue.push(p).is_err() {
                break;
            }
        }
        if was_empty && !self.queue.is_empty() {
            let _guard = self.wakeup.mutex.lock();
            self.wakeup.condvar.notify_one();
        }
    }

    /// Pops one page if available without blocking.
    pub fn try_take(&self) -> Option<PageAddr> {
        self.queue.pop()
    }

    /// Blocks until a page is available or `quit` has been signalled.
    /// Returns `None` only when quitting.
    pub fn wait_take(&self) -> Option<PageAddr> {
        loop {
            if let Some(p) = self.try_take() {
                return Some(p);
            }
            let mut guard = self.wakeup.mutex.lock();
            // Re-check under the lock: a page may have landed between the
            // failed try_take above and acquiring the mutex.
            if let Some(p) = self.try_take() {
                return Some(p);
            }
            if self.wakeup.quit.load(Ordering::Relaxed) {
                return None;
            }
            self.wakeup.condvar.wait(&mut guard);
            if self.wakeup.quit.load(Ordering::Relaxed) {
                return None;
            }
        }
    }

    pub fn signal_quit(&self) {
        let _guard = self.wakeup.mutex.lock();
        self.wakeup.quit.store(true, Ordering::Relaxed);
        self.wakeup.condvar.notify_all();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_overflow_instead_of_blocking() {
        let ring = RewarmRing::new(2);
        ring.offer(&[1, 2, 3, 4]);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.try_take(), Some(1));
        assert_eq!(ring.try_take(), Some(2));
        assert_eq!(ring.try_take(), None);
    }

    #[test]
    fn wait_take_returns_none_after_quit_on_empty_ring() {
        let ring = RewarmRing::new(4);
        ring.signal_quit();
        assert_eq!(ring.wait_take(), None);
    }

    #[test]
    fn wait_take_wakes_on_offer() {
        let ring = RewarmRing::new(4);
        let ring2 = ring.clone();
        let t = std::thread::spawn(move || ring2.wait_take());
        std::thread::sleep(std::time::Duration::from_millis(20));
        ring.offer(&[42]);
        assert_eq!(t.join().unwrap(), Some(42));
    }
}
