//! The low-level per-thread blocking point.

use std::sync::atomic::{fence, AtomicI32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Why a timed park returned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitResult {
    /// A wakeup was delivered, either during the wait or before it started.
    Woken,
    /// The deadline passed with no wakeup.
    TimedOut,
}

/// A one-shot blocking point with a sticky wakeup.
///
/// Each runtime thread owns one event for its internal blocking (monitor
/// waits, suspension). The protocol is strictly single-consumer: only the
/// owning thread parks, any thread may unpark. A wakeup delivered while
/// nobody is parked is remembered and consumed by the next park.
pub struct ParkEvent {
    /// -1 the owner is blocked or about to block, 0 neutral, 1 wakeup pending.
    counter: AtomicI32,
    /// Number of threads blocked on the condvar, 0 or 1.
    parked: Mutex<usize>,
    cond: Condvar,
}

impl Default for ParkEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl ParkEvent {
    pub fn new() -> Self {
        ParkEvent {
            counter: AtomicI32::new(0),
            parked: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Block until an unpark is delivered. Consumes a pending wakeup without
    /// blocking. Returns only on a wakeup, never spuriously.
    pub fn park(&self) {
        // Claiming waiter status and consuming a pending permit are the same
        // decrement: 1 -> 0 consumed it, 0 -> -1 announces the wait.
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        debug_assert!((0..=1).contains(&prev), "multiple concurrent parkers");
        if prev == 1 {
            return;
        }

        let mut parked = self.parked.lock().unwrap();
        *parked += 1;
        while self.counter.load(Ordering::SeqCst) < 0 {
            parked = self.cond.wait(parked).unwrap();
        }
        *parked -= 1;
        drop(parked);
        self.counter.store(0, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    /// Block until an unpark is delivered or `timeout` passes. The counter is
    /// re-examined on the way out so a wakeup racing the deadline is reported
    /// as [`WaitResult::Woken`], not lost.
    pub fn park_timeout(&self, timeout: Duration) -> WaitResult {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        debug_assert!((0..=1).contains(&prev), "multiple concurrent parkers");
        if prev == 1 {
            return WaitResult::Woken;
        }

        let deadline = Instant::now() + timeout;
        let mut parked = self.parked.lock().unwrap();
        *parked += 1;
        let mut timed_out = false;
        while self.counter.load(Ordering::SeqCst) < 0 && !timed_out {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero()) else {
                timed_out = true;
                break;
            };
            let (guard, wait) = self.cond.wait_timeout(parked, remaining).unwrap();
            parked = guard;
            timed_out = wait.timed_out();
        }
        *parked -= 1;
        drop(parked);

        // Distinguish a real wakeup from the deadline: the waker raised the
        // counter before signalling, the clock did not. One swap both reads
        // and resets, so a wakeup racing the deadline is either consumed and
        // reported here or left pending for the next park, never erased.
        let prev = self.counter.swap(0, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        if prev >= 0 {
            WaitResult::Woken
        } else {
            WaitResult::TimedOut
        }
    }

    /// Deliver a wakeup. If the owner is parked it is released; otherwise the
    /// wakeup is stored for the owner's next park. Multiple unparks coalesce
    /// into one pending wakeup.
    pub fn unpark(&self) {
        if self.counter.swap(1, Ordering::SeqCst) >= 0 {
            // Nobody was blocked; the stored permit is enough.
            return;
        }
        // The owner may be between claiming waiter status and blocking.
        // Taking the mutex serializes against that window; signalling after
        // dropping it keeps the woken thread off the mutex we still hold.
        let waiters = *self.parked.lock().unwrap();
        if waiters > 0 {
            self.cond.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::panic_after;
    use std::sync::Arc;

    #[test]
    fn unpark_before_park_returns_immediately() {
        panic_after(2000, || {
            let event = ParkEvent::new();
            event.unpark();
            event.park();
        });
    }

    #[test]
    fn unparks_coalesce() {
        let event = ParkEvent::new();
        event.unpark();
        event.unpark();
        event.unpark();
        // Only one wakeup was stored.
        event.park();
        assert_eq!(event.park_timeout(Duration::from_millis(10)), WaitResult::TimedOut);
    }

    #[test]
    fn timed_park_times_out_without_wakeup() {
        panic_after(5000, || {
            let event = ParkEvent::new();
            let start = Instant::now();
            let result = event.park_timeout(Duration::from_millis(50));
            assert_eq!(result, WaitResult::TimedOut);
            assert!(start.elapsed() >= Duration::from_millis(50));
        });
    }

    #[test]
    fn park_is_released_by_unpark() {
        panic_after(5000, || {
            let event = Arc::new(ParkEvent::new());
            let waker = event.clone();
            let handle = std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                waker.unpark();
            });
            event.park();
            handle.join().unwrap();
        });
    }

    #[test]
    fn racing_unpark_reports_woken() {
        // An unpark landing near the deadline must never be swallowed: the
        // parker either times out with the wakeup still pending, or reports
        // Woken. Run many short races and check no wakeup is lost.
        panic_after(60_000, || {
            let event = Arc::new(ParkEvent::new());
            for _ in 0..200 {
                let waker = event.clone();
                let handle = std::thread::spawn(move || {
                    waker.unpark();
                });
                let result = event.park_timeout(Duration::from_millis(1));
                handle.join().unwrap();
                if result == WaitResult::TimedOut {
                    // The wakeup arrived after we gave up; it must still be
                    // stored for the next park.
                    event.park();
                }
            }
        });
    }

    #[test]
    fn park_unpark_ping_pong() {
        panic_after(30_000, || {
            let ping = Arc::new(ParkEvent::new());
            let pong = Arc::new(ParkEvent::new());
            let (ping2, pong2) = (ping.clone(), pong.clone());
            let handle = std::thread::spawn(move || {
                for _ in 0..1000 {
                    ping2.park();
                    pong2.unpark();
                }
            });
            for _ in 0..1000 {
                ping.unpark();
                pong.park();
            }
            handle.join().unwrap();
        });
    }
}
