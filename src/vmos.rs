//! The top-level runtime-services object.

use std::sync::Arc;

use crate::address_space::{AddressSpaceManager, NumaInterface, PageSizeTable};
use crate::nmt::{MemoryCategory, NativeMemoryTracker};
use crate::thread::NativeThreadService;

/// Every OS-facing service the VM uses, constructed once at startup.
///
/// Construct-once, read-many: the page-size table, NUMA topology and
/// scheduling class are probed here and never re-probed; the memory tracker's
/// level comes from the environment and can only ever go down. There are no
/// process-wide mutable globals behind this object, two instances are two
/// independent worlds (sharing only the kernel underneath).
pub struct VmOs {
    tracker: Arc<NativeMemoryTracker>,
    page_sizes: Arc<PageSizeTable>,
    numa: Arc<NumaInterface>,
    threads: NativeThreadService,
}

impl Default for VmOs {
    fn default() -> Self {
        Self::new()
    }
}

impl VmOs {
    /// Build the services, reading the tracking level from the environment.
    pub fn new() -> Self {
        Self::with_tracker(Arc::new(NativeMemoryTracker::from_env()))
    }

    /// Build the services around an existing tracker. Used by embedders that
    /// decide the tracking level themselves.
    pub fn with_tracker(tracker: Arc<NativeMemoryTracker>) -> Self {
        // Fails harmlessly if the embedder already installed a logger.
        crate::util::logger::try_init().ok();
        let page_sizes = Arc::new(PageSizeTable::query());
        let numa = Arc::new(NumaInterface::query());
        info!(
            "runtime services up: base page {} bytes, {} large page size(s), {} NUMA group(s), \
             tracking {}",
            page_sizes.base(),
            page_sizes.large_sizes().len(),
            numa.groups(),
            tracker.tracking_level(),
        );
        let threads = NativeThreadService::new(tracker.clone(), page_sizes.clone(), numa.clone());
        VmOs {
            tracker,
            page_sizes,
            numa,
            threads,
        }
    }

    pub fn tracker(&self) -> &Arc<NativeMemoryTracker> {
        &self.tracker
    }

    pub fn threads(&self) -> &NativeThreadService {
        &self.threads
    }

    pub fn page_sizes(&self) -> &PageSizeTable {
        &self.page_sizes
    }

    pub fn numa(&self) -> &NumaInterface {
        &self.numa
    }

    /// An address-space manager charging the given category. Each subsystem
    /// makes its own; managers share the probed tables and the tracker.
    pub fn address_space(&self, category: MemoryCategory) -> AddressSpaceManager {
        self.address_space_with_interleave(category, false)
    }

    pub fn address_space_with_interleave(
        &self,
        category: MemoryCategory,
        numa_interleave: bool,
    ) -> AddressSpaceManager {
        AddressSpaceManager::new(
            self.tracker.clone(),
            category,
            self.page_sizes.clone(),
            self.numa.clone(),
            numa_interleave,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmt::TrackingLevel;
    use crate::park::ParkTime;
    use crate::thread::{ThreadKind, VmPriority};
    use crate::util::constants::BYTES_IN_MBYTE;
    use crate::util::test_util::{panic_after, serial_test};
    use crate::util::VMThread;

    fn vmos_at(level: TrackingLevel) -> VmOs {
        VmOs::with_tracker(Arc::new(NativeMemoryTracker::with_level(level)))
    }

    #[test]
    fn heap_lifecycle_shows_up_in_report() {
        serial_test(|| {
            let vmos = vmos_at(TrackingLevel::Detail);
            let heap = vmos.address_space(MemoryCategory::JavaHeap);
            let mut region = heap.reserve(4 * BYTES_IN_MBYTE, false).unwrap();
            heap.commit(&mut region, false).unwrap();

            let mut out = Vec::new();
            vmos.tracker().report(&mut out).unwrap();
            let text = String::from_utf8(out).unwrap();
            assert!(text.contains("Java Heap"));
            assert!(text.contains(file!()));

            heap.uncommit(&mut region).unwrap();
            heap.release(region).unwrap();
            let baseline = vmos.tracker().baseline();
            assert_eq!(baseline.category(MemoryCategory::JavaHeap).reserved, 0);
        });
    }

    #[test]
    fn thread_parks_until_unparked() {
        panic_after(10_000, || {
            let vmos = vmos_at(TrackingLevel::Off);
            let thread = vmos
                .threads()
                .create(ThreadKind::GcConcurrent, 0, VMThread::UNINITIALIZED, |me| {
                    // Interrupted parks return immediately, timed parks expire;
                    // the indefinite park below waits for the creator.
                    me.parker().park(me, Some(ParkTime::RelativeNanos(1_000_000)));
                    me.park_event().park();
                })
                .unwrap();
            vmos.threads().set_priority(&thread, VmPriority::NORMAL);
            vmos.threads().start(&thread);
            thread.park_event().unpark();
            vmos.threads().join(&thread);
        });
    }

    #[test]
    fn two_instances_are_independent() {
        let a = vmos_at(TrackingLevel::Summary);
        let b = vmos_at(TrackingLevel::Summary);
        a.tracker().record_reserve(MemoryCategory::Class, 4096);
        assert_eq!(b.tracker().baseline().total_reserved(), 0);
        assert_eq!(a.tracker().baseline().total_reserved(), 4096);
    }
}
