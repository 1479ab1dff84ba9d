//! Buffer-availability signal between consumers and the decode thread.
//!
//! The producer parks here when the queues are saturated; a consumer pokes
//! it after every successful pop. A wakeup is only a hint that space *may*
//! exist: the producer always re-checks queue depth and may park again.
//!
//! One notification is latched when nobody is parked, so a pop that lands
//! between the producer's depth check and its `wait()` still wakes it.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct SignalState {
    /// A notification arrived that no waiter has consumed yet
    pending: bool,
    waiting: bool,
    notifications: u64,
    wakeups: u64,
}

/// Single-producer wait/notify primitive
#[derive(Default)]
pub struct BufferSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl BufferSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park the calling thread until the next notification
    pub fn wait(&self) {
        let mut state = self.state.lock();
        state.waiting = true;
        while !state.pending {
            self.cond.wait(&mut state);
        }
        state.pending = false;
        state.waiting = false;
        state.wakeups += 1;
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    ///
    /// Returns `true` if a notification was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.waiting = true;
        while !state.pending {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        let notified = std::mem::take(&mut state.pending);
        state.waiting = false;
        if notified {
            state.wakeups += 1;
        }
        notified
    }

    /// Wake the producer if it is parked, otherwise latch one wakeup
    pub fn notify(&self) {
        let mut state = self.state.lock();
        state.pending = true;
        state.notifications += 1;
        self.cond.notify_one();
    }

    /// Whether a thread is currently parked in `wait`
    pub fn is_waiting(&self) -> bool {
        self.state.lock().waiting
    }

    /// (notifications sent, wakeups consumed)
    pub fn counters(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.notifications, state.wakeups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_notify_wakes_waiter() {
        let signal = Arc::new(BufferSignal::new());
        let woke = Arc::new(AtomicBool::new(false));

        let waiter = {
            let signal = Arc::clone(&signal);
            let woke = Arc::clone(&woke);
            thread::spawn(move || {
                signal.wait();
                woke.store(true, Ordering::SeqCst);
            })
        };

        let deadline = Instant::now() + Duration::from_secs(2);
        while !signal.is_waiting() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(signal.is_waiting());
        assert!(!woke.load(Ordering::SeqCst));

        signal.notify();
        waiter.join().unwrap();
        assert!(woke.load(Ordering::SeqCst));
        assert!(!signal.is_waiting());
    }

    #[test]
    fn test_notification_before_wait_is_latched() {
        let signal = BufferSignal::new();
        signal.notify();

        // would block forever without the latch
        signal.wait();
        assert_eq!(signal.counters(), (1, 1));
    }

    #[test]
    fn test_latch_holds_a_single_wakeup() {
        let signal = BufferSignal::new();
        signal.notify();
        signal.notify();
        signal.notify();

        assert!(signal.wait_timeout(Duration::from_millis(10)));
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_timeout_expires() {
        let signal = BufferSignal::new();
        let start = Instant::now();
        assert!(!signal.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
