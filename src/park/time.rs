//! Park deadlines and the monotonic clock behind them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Cap on any single wait. Deadlines further out are clamped so that
/// conversions to the kernel's timespec cannot overflow; a wait that long is
/// indistinguishable from forever and simply re-blocks after the cap.
const MAX_SECS: u64 = 100_000_000;

/// How long a timed park should wait.
#[derive(Debug, Copy, Clone)]
pub enum ParkTime {
    /// Until the wall clock reaches this many milliseconds since the epoch.
    /// Used for managed-code absolute waits; a past deadline returns at once.
    AbsoluteMillis(i64),
    /// For this long from now.
    RelativeNanos(i64),
}

impl ParkTime {
    /// Convert to a bounded duration from now. `None` means the deadline has
    /// already passed (or was never in the future) and the caller must not
    /// block at all.
    pub fn to_duration(self) -> Option<Duration> {
        let dur = match self {
            ParkTime::AbsoluteMillis(deadline) => {
                if deadline <= 0 {
                    return None;
                }
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::ZERO);
                let deadline = Duration::from_millis(deadline as u64);
                deadline.checked_sub(now)?
            }
            ParkTime::RelativeNanos(nanos) => {
                if nanos <= 0 {
                    return None;
                }
                Duration::from_nanos(nanos as u64)
            }
        };
        if dur.is_zero() {
            return None;
        }
        Some(dur.min(Duration::from_secs(MAX_SECS)))
    }
}

lazy_static! {
    static ref CLOCK_EPOCH: Instant = Instant::now();
}

static LAST_NANOS: AtomicU64 = AtomicU64::new(0);

/// Nanoseconds since the first call, guaranteed never to move backwards even
/// if the underlying clock does. Ties are broken by returning the larger of
/// the stored maximum and the observation.
pub fn elapsed_nanos() -> u64 {
    let obsv = CLOCK_EPOCH.elapsed().as_nanos() as u64;
    let mut prev = LAST_NANOS.load(Ordering::Relaxed);
    loop {
        if obsv <= prev {
            return prev;
        }
        match LAST_NANOS.compare_exchange_weak(prev, obsv, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return obsv,
            // Someone advanced the clock concurrently. Their value is at
            // least as fresh as ours, so return whichever is larger.
            Err(newer) => {
                if obsv <= newer {
                    return newer;
                }
                prev = newer;
            }
        }
    }
}
