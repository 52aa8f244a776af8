//! The permit-based parker backing managed-code `park`/`unpark`.

use std::sync::atomic::{fence, AtomicI32, Ordering};
use std::sync::{Condvar, Mutex};

use super::time::ParkTime;
use crate::thread::NativeThread;

/// One permit, sticky, never more than one. Unlike [`super::ParkEvent`],
/// parking here may return spuriously and the caller is expected to re-check
/// its own condition; that freedom is what keeps every path here non-blocking
/// except the actual wait.
pub struct Parker {
    /// 1 a permit is available, 0 otherwise.
    counter: AtomicI32,
    mutex: Mutex<()>,
    cond: Condvar,
}

impl Default for Parker {
    fn default() -> Self {
        Self::new()
    }
}

impl Parker {
    pub fn new() -> Self {
        Parker {
            counter: AtomicI32::new(0),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Park the calling thread, which must be the one `thread` describes.
    ///
    /// Returns immediately when a permit is pending, when the thread is
    /// interrupted, or when a timed park's deadline has already passed.
    /// `time` of `None` waits indefinitely. Any return consumes the permit
    /// if one was delivered; none of the returns say why they happened.
    pub fn park(&self, thread: &NativeThread, time: Option<ParkTime>) {
        // Consume a pending permit without touching the mutex.
        if self.counter.swap(0, Ordering::SeqCst) > 0 {
            return;
        }
        if thread.is_interrupted() {
            return;
        }
        let duration = match time {
            Some(t) => match t.to_duration() {
                Some(d) => Some(d),
                // Deadline already passed.
                None => return,
            },
            None => None,
        };

        // Never block on the mutex. A holder is either delivering a permit
        // (return now, the permit is stored for next time) or another parker,
        // which is a usage error this refuses to deadlock on.
        let Ok(guard) = self.mutex.try_lock() else {
            return;
        };
        // The permit may have arrived between the swap and the lock.
        if self.counter.load(Ordering::SeqCst) > 0 {
            self.counter.store(0, Ordering::SeqCst);
            return;
        }
        if thread.is_interrupted() {
            return;
        }

        let _blocked = thread.block_guard();
        // A single wait. Spurious returns are allowed, so there is no loop;
        // the caller re-checks its own condition.
        let guard = match duration {
            Some(d) => self.cond.wait_timeout(guard, d).unwrap().0,
            None => self.cond.wait(guard).unwrap(),
        };
        self.counter.store(0, Ordering::SeqCst);
        drop(guard);
        fence(Ordering::SeqCst);
    }

    /// Make a permit available, waking the owner if it is parked. At most one
    /// permit is ever stored.
    pub fn unpark(&self) {
        let guard = self.mutex.lock().unwrap();
        let pending = self.counter.load(Ordering::SeqCst);
        self.counter.store(1, Ordering::SeqCst);
        drop(guard);
        if pending < 1 {
            self.cond.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::panic_after;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn permit_makes_park_immediate() {
        panic_after(2000, || {
            let thread = NativeThread::test_stub();
            let parker = Parker::new();
            parker.unpark();
            parker.park(&thread, None);
        });
    }

    #[test]
    fn permits_do_not_accumulate() {
        panic_after(5000, || {
            let thread = NativeThread::test_stub();
            let parker = Parker::new();
            parker.unpark();
            parker.unpark();
            parker.park(&thread, None);
            // The second park has no permit left and must wait out its time.
            let start = Instant::now();
            parker.park(&thread, Some(ParkTime::RelativeNanos(50_000_000)));
            assert!(start.elapsed() >= Duration::from_millis(40));
        });
    }

    #[test]
    fn interrupt_makes_park_immediate() {
        panic_after(2000, || {
            let thread = NativeThread::test_stub();
            thread.set_interrupted(true);
            let parker = Parker::new();
            parker.park(&thread, None);
        });
    }

    #[test]
    fn expired_deadline_makes_park_immediate() {
        panic_after(2000, || {
            let thread = NativeThread::test_stub();
            let parker = Parker::new();
            parker.park(&thread, Some(ParkTime::RelativeNanos(0)));
            parker.park(&thread, Some(ParkTime::RelativeNanos(-1)));
            parker.park(&thread, Some(ParkTime::AbsoluteMillis(1)));
        });
    }

    #[test]
    fn unpark_releases_parked_thread() {
        panic_after(5000, || {
            let thread = Arc::new(NativeThread::test_stub());
            let parker = Arc::new(Parker::new());
            let (t2, p2) = (thread.clone(), parker.clone());
            let handle = std::thread::spawn(move || {
                p2.park(&t2, None);
            });
            std::thread::sleep(Duration::from_millis(50));
            parker.unpark();
            handle.join().unwrap();
        });
    }

    #[test]
    fn blocked_flag_tracks_wait() {
        panic_after(5000, || {
            let thread = Arc::new(NativeThread::test_stub());
            let parker = Arc::new(Parker::new());
            let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let (t2, p2, d2) = (thread.clone(), parker.clone(), done.clone());
            // Parks in a loop: spurious returns just re-park.
            let handle = std::thread::spawn(move || {
                while !d2.load(std::sync::atomic::Ordering::SeqCst) {
                    p2.park(&t2, None);
                }
            });
            while !thread.is_blocked() {
                std::thread::yield_now();
            }
            done.store(true, std::sync::atomic::Ordering::SeqCst);
            parker.unpark();
            handle.join().unwrap();
            assert!(!thread.is_blocked());
        });
    }
}
