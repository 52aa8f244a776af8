use std::collections::HashMap;
use std::io;
use std::str::FromStr;
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use atomic::Atomic;
use enum_map::EnumMap;

use super::baseline::{CategorySnapshot, MemoryBaseline, SiteSnapshot};
use super::{CallSite, MemoryCategory, TrackingLevel};

/// Name prefix of the per-process environment key selecting the initial
/// tracking level. The full key is suffixed with the process id so the setting
/// cannot leak into unrelated processes sharing the environment.
pub const TRACKING_LEVEL_ENV_PREFIX: &str = "NMT_LEVEL_";

/// Per-category accounting words. Updated with relaxed atomics from every
/// tracked call site; consistency across the words is only needed when a
/// baseline snapshots them, and a baseline is explicitly a point-in-time
/// approximation under concurrent allocation.
#[derive(Default)]
pub(super) struct CategoryCounter {
    pub(super) reserved: AtomicUsize,
    pub(super) committed: AtomicUsize,
    pub(super) malloc_bytes: AtomicUsize,
    pub(super) malloc_count: AtomicUsize,
}

#[derive(Default, Copy, Clone)]
pub(super) struct SiteCounter {
    pub(super) reserved: usize,
    pub(super) count: usize,
}

/// The process-wide native-memory accounting state machine.
///
/// Constructed once at startup (see [`NativeMemoryTracker::from_env`]) before
/// any tracked allocation, then shared by reference with every tracked
/// subsystem. The tracking level is read without locking at every call site
/// and written only through the guarded [`downgrade`](Self::downgrade).
pub struct NativeMemoryTracker {
    level: Atomic<TrackingLevel>,
    env_valid: AtomicBool,
    categories: EnumMap<MemoryCategory, CategoryCounter>,
    /// Call-site table, maintained only at `Detail`. The mutex is never taken
    /// on the level-check fast path.
    sites: Mutex<HashMap<(CallSite, MemoryCategory), SiteCounter>>,
    final_report_ran: AtomicBool,
}

impl NativeMemoryTracker {
    pub fn with_level(level: TrackingLevel) -> Self {
        NativeMemoryTracker {
            level: Atomic::new(level),
            env_valid: AtomicBool::new(true),
            categories: EnumMap::default(),
            sites: Mutex::new(HashMap::new()),
            final_report_ran: AtomicBool::new(false),
        }
    }

    /// Resolve the initial tracking level from the `NMT_LEVEL_<pid>`
    /// environment key. This must run before any tracked allocation.
    ///
    /// An invalid value is a configuration error, not a fatal one: it is
    /// recorded (see [`is_env_valid`](Self::is_env_valid)), surfaced later by
    /// whoever validates startup options, and tracking defaults to `Off`.
    pub fn from_env() -> Self {
        let key = format!("{}{}", TRACKING_LEVEL_ENV_PREFIX, std::process::id());
        let mut level = TrackingLevel::Off;
        let mut env_valid = true;
        if let Ok(value) = std::env::var(&key) {
            match TrackingLevel::from_str(&value) {
                Ok(parsed) => level = parsed,
                Err(_) => env_valid = false,
            }
            // Remove the variable so it does not leak to child processes.
            std::env::remove_var(&key);
        }
        let tracker = Self::with_level(level);
        tracker.env_valid.store(env_valid, Ordering::Relaxed);
        tracker
    }

    pub fn tracking_level(&self) -> TrackingLevel {
        self.level.load(Ordering::Acquire)
    }

    /// Was the environment key a well-formed level? Queried by startup option
    /// validation after the fact.
    pub fn is_env_valid(&self) -> bool {
        self.env_valid.load(Ordering::Relaxed)
    }

    /// Move the tracking level downward.
    ///
    /// * Moving to `Off` once tracking has ever exceeded `Off` is rejected.
    /// * A level not lower than the current one succeeds as a no-op.
    /// * Otherwise the lower level is published first, so concurrent call
    ///   sites immediately stop recording at the old granularity, and only
    ///   then is the state not retained at the new level discarded.
    pub fn downgrade(&self, level: TrackingLevel) -> bool {
        let current = self.tracking_level();
        if level == TrackingLevel::Off && current != TrackingLevel::Off {
            debug_assert!(false, "cannot transition tracking back to off");
            return false;
        }
        if level >= current {
            return true;
        }
        // Publish the lower level before touching any dependent state. Other
        // threads may still be inside a record_* call that passed the old
        // level check; those updates are benign (they only touch counters that
        // survive, or a site table entry we are about to drop).
        let _ = self
            .level
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                (level < cur).then_some(level)
            });
        fence(Ordering::SeqCst);

        if level < TrackingLevel::Detail {
            self.sites.lock().unwrap().clear();
        }
        if level < TrackingLevel::Summary {
            for counter in self.categories.values() {
                counter.reserved.store(0, Ordering::Relaxed);
                counter.committed.store(0, Ordering::Relaxed);
                counter.malloc_bytes.store(0, Ordering::Relaxed);
                counter.malloc_count.store(0, Ordering::Relaxed);
            }
        }
        true
    }

    /// Downgrade to the residual shutdown level, if tracking was ever above it.
    pub fn shutdown(&self) {
        if self.tracking_level() > TrackingLevel::Minimal {
            self.downgrade(TrackingLevel::Minimal);
        }
    }

    fn recording(&self) -> Option<TrackingLevel> {
        let level = self.tracking_level();
        (level >= TrackingLevel::Summary).then_some(level)
    }

    #[track_caller]
    pub fn record_reserve(&self, category: MemoryCategory, bytes: usize) {
        let Some(level) = self.recording() else { return };
        self.categories[category]
            .reserved
            .fetch_add(bytes, Ordering::Relaxed);
        if level == TrackingLevel::Detail {
            let site = CallSite::caller();
            let mut sites = self.sites.lock().unwrap();
            let counter = sites.entry((site, category)).or_default();
            counter.reserved += bytes;
            counter.count += 1;
        }
    }

    pub fn record_commit(&self, category: MemoryCategory, bytes: usize) {
        if self.recording().is_none() {
            return;
        }
        self.categories[category]
            .committed
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_uncommit(&self, category: MemoryCategory, bytes: usize) {
        if self.recording().is_none() {
            return;
        }
        let prev = self.categories[category]
            .committed
            .fetch_sub(bytes, Ordering::Relaxed);
        debug_assert!(prev >= bytes);
        #[cfg(feature = "extreme_assertions")]
        assert!(prev >= bytes, "uncommit underflow in {}", category.name());
    }

    /// Record releasing reserved address space. If the released range was
    /// still committed the caller must record the uncommit separately.
    pub fn record_release(&self, category: MemoryCategory, bytes: usize) {
        if self.recording().is_none() {
            return;
        }
        let prev = self.categories[category]
            .reserved
            .fetch_sub(bytes, Ordering::Relaxed);
        debug_assert!(prev >= bytes);
        #[cfg(feature = "extreme_assertions")]
        assert!(prev >= bytes, "release underflow in {}", category.name());
    }

    #[track_caller]
    pub fn record_alloc(&self, category: MemoryCategory, bytes: usize) {
        let Some(level) = self.recording() else { return };
        let counter = &self.categories[category];
        counter.malloc_bytes.fetch_add(bytes, Ordering::Relaxed);
        counter.malloc_count.fetch_add(1, Ordering::Relaxed);
        if level == TrackingLevel::Detail {
            let site = CallSite::caller();
            let mut sites = self.sites.lock().unwrap();
            let counter = sites.entry((site, category)).or_default();
            counter.reserved += bytes;
            counter.count += 1;
        }
    }

    pub fn record_free(&self, category: MemoryCategory, bytes: usize) {
        if self.recording().is_none() {
            return;
        }
        let counter = &self.categories[category];
        let prev = counter.malloc_bytes.fetch_sub(bytes, Ordering::Relaxed);
        debug_assert!(prev >= bytes);
        counter.malloc_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Build an immutable point-in-time snapshot of the tracked allocations.
    pub fn baseline(&self) -> MemoryBaseline {
        let level = self.tracking_level();
        let mut by_category: EnumMap<MemoryCategory, CategorySnapshot> = EnumMap::default();
        for (category, counter) in self.categories.iter() {
            by_category[category] = CategorySnapshot {
                reserved: counter.reserved.load(Ordering::Relaxed),
                committed: counter.committed.load(Ordering::Relaxed),
                malloc_bytes: counter.malloc_bytes.load(Ordering::Relaxed),
                malloc_count: counter.malloc_count.load(Ordering::Relaxed),
            };
        }
        let sites = if level == TrackingLevel::Detail {
            self.sites
                .lock()
                .unwrap()
                .iter()
                .map(|(&(site, category), counter)| SiteSnapshot {
                    site,
                    category,
                    reserved: counter.reserved,
                    count: counter.count,
                })
                .collect()
        } else {
            Vec::new()
        };
        MemoryBaseline::new(level, by_category, sites)
    }

    /// Render a point-in-time report. Idempotent; may be called repeatedly
    /// from diagnostic paths.
    pub fn report(&self, out: &mut dyn io::Write) -> io::Result<()> {
        if self.recording().is_none() {
            return Ok(());
        }
        let baseline = self.baseline();
        baseline.render(out)
    }

    /// Summary-only report for the error path. Detail is skipped even at the
    /// `Detail` level: the site table mutex may be held by the crashing
    /// thread.
    pub fn error_report(&self, out: &mut dyn io::Write) -> io::Result<()> {
        if self.recording().is_none() {
            return Ok(());
        }
        self.baseline().render_summary(out)
    }

    /// Report once, at process end. Both the error path and the normal
    /// shutdown path funnel here, possibly concurrently; the body runs at most
    /// once per process no matter the interleaving.
    pub fn final_report(&self, out: &mut dyn io::Write) -> io::Result<()> {
        if self
            .final_report_ran
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.report(out)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn final_report_has_run(&self) -> bool {
        self.final_report_ran.load(Ordering::SeqCst)
    }
}
