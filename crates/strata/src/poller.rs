// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wake-up primitive shared by every layer of a thread's transporter stack.
//!
//! # Architecture
//! - Atomic flag for the lock-free producer path (`notify`)
//! - Condvar fallback for the idle consumer (`wait`)
//!
//! One [`PollNotifier`] exists per thread stack. Producers on other threads
//! (inter-thread publishers, the portal I/O thread, the application when it
//! flips a worker's `alive` flag) hold a clone of the `Arc` and call
//! [`PollNotifier::notify`].

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Wake notification with an atomic fast-path.
///
/// Many producers, one consuming thread per stack. Unlike a single-shot
/// waker, `wait` takes an optional timeout (`None` blocks until notified, as
/// `poll(None)` requires) and `notify` uses `notify_all`, so a test or helper
/// waiting alongside the owner is never starved.
#[derive(Debug)]
pub struct PollNotifier {
    data_ready: AtomicBool,
    /// Set while a consumer is parked on the condvar.
    sleeping: Mutex<bool>,
    condvar: Condvar,
}

impl PollNotifier {
    #[inline]
    pub fn new() -> Self {
        Self {
            data_ready: AtomicBool::new(false),
            sleeping: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    #[inline]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Signals that work is available.
    #[inline]
    pub fn notify(&self) {
        self.data_ready.store(true, Ordering::Release);

        // Racy check; worst case is one extra signal.
        if *self.sleeping.lock() {
            self.condvar.notify_all();
        }
    }

    #[inline]
    pub fn check_and_clear(&self) -> bool {
        self.data_ready.swap(false, Ordering::Acquire)
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.data_ready.load(Ordering::Acquire)
    }

    /// Blocks until notified or until `timeout` elapses (`None` = forever).
    ///
    /// Returns immediately when a notification is already pending.
    /// Returns `true` when woken by a notification.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        if self.data_ready.swap(false, Ordering::Acquire) {
            return true;
        }

        let mut sleeping = self.sleeping.lock();

        // Double-check after acquiring lock
        if self.data_ready.swap(false, Ordering::Acquire) {
            return true;
        }

        *sleeping = true;
        match timeout {
            Some(timeout) => {
                let _ = self.condvar.wait_for(&mut sleeping, timeout);
            }
            None => {
                while !self.data_ready.load(Ordering::Acquire) {
                    self.condvar.wait(&mut sleeping);
                }
            }
        }
        *sleeping = false;

        self.data_ready.swap(false, Ordering::Acquire)
    }
}

impl Default for PollNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// A transporter layer that can be polled for pending deliveries.
pub trait Pollable {
    /// Notifier shared by the whole stack this layer belongs to.
    fn notifier(&self) -> &Arc<PollNotifier>;

    /// Processes everything pending right now, without blocking.
    /// Returns the number of items processed.
    fn poll_all(&mut self) -> usize;

    /// Processes pending items, blocking until at least one is available.
    ///
    /// `Some(Duration::ZERO)` drains what is queued and returns; `None` waits
    /// indefinitely; `Some(t)` waits at most `t`. Returns the number of items
    /// processed (0 on timeout).
    fn poll(&mut self, timeout: Option<Duration>) -> usize {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let items = self.poll_all();
            if items > 0 {
                return items;
            }
            match deadline {
                None => {
                    self.notifier().wait(None);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return 0;
                    }
                    self.notifier().wait(Some(deadline - now));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fast_path() {
        let notifier = PollNotifier::new();
        assert!(!notifier.is_ready());
        notifier.notify();
        assert!(notifier.is_ready());
        assert!(notifier.check_and_clear());
        assert!(!notifier.is_ready());
    }

    #[test]
    fn test_notify_wakes_waiter() {
        let notifier = PollNotifier::shared();
        let n = Arc::clone(&notifier);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            n.notify();
        });

        let start = Instant::now();
        assert!(notifier.wait(None), "should be woken by notify");
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }

    #[test]
    fn test_timeout_without_notify() {
        let notifier = PollNotifier::new();
        let start = Instant::now();
        assert!(!notifier.wait(Some(Duration::from_millis(10))));
        assert!(start.elapsed() >= Duration::from_millis(9));
    }

    struct Counter {
        notifier: Arc<PollNotifier>,
        pending: usize,
    }

    impl Pollable for Counter {
        fn notifier(&self) -> &Arc<PollNotifier> {
            &self.notifier
        }

        fn poll_all(&mut self) -> usize {
            std::mem::take(&mut self.pending)
        }
    }

    #[test]
    fn test_poll_zero_timeout_drains() {
        let mut counter = Counter {
            notifier: PollNotifier::shared(),
            pending: 3,
        };
        assert_eq!(counter.poll(Some(Duration::ZERO)), 3);
        assert_eq!(counter.poll(Some(Duration::ZERO)), 0);
    }

    #[test]
    fn test_poll_times_out() {
        let mut counter = Counter {
            notifier: PollNotifier::shared(),
            pending: 0,
        };
        let start = Instant::now();
        assert_eq!(counter.poll(Some(Duration::from_millis(20))), 0);
        assert!(start.elapsed() >= Duration::from_millis(19));
    }
}
