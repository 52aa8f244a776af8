//! Address-space management.
//!
//! The [`AddressSpaceManager`] reserves, commits, protects and releases
//! page-aligned address ranges on behalf of one VM subsystem (heap, code
//! cache, thread stacks). Calls may block arbitrarily long inside the kernel
//! and are not safe to issue concurrently against overlapping ranges; callers
//! serialize overlapping requests themselves.
//!
//! Failure semantics follow the VM's taxonomy: exhaustion while reserving is
//! an ordinary refusal (`None`), exhaustion while committing an
//! already-reserved range is unrecoverable and aborts the process after
//! diagnostics.

mod numa;
mod page_size;
mod region;

pub use numa::NumaInterface;
pub use page_size::PageSizeTable;
pub use region::{AddressRegion, RegionState};

use std::sync::Arc;

use crate::nmt::{MemoryCategory, NativeMemoryTracker};
use crate::util::conversions;
use crate::util::memory::{self, Protection};
use crate::util::Address;

/// An anonymous mapping that has not been accepted yet. Dropping the guard
/// unmaps it, so an exact-address attempt that lands elsewhere is undone on
/// every exit path; [`disarm`](RawMapping::disarm) is the only way to keep the
/// mapping alive.
struct RawMapping {
    addr: Address,
    size: usize,
    armed: bool,
}

impl RawMapping {
    fn new(addr: Address, size: usize) -> Self {
        RawMapping {
            addr,
            size,
            armed: true,
        }
    }

    fn disarm(mut self) -> Address {
        self.armed = false;
        self.addr
    }
}

impl Drop for RawMapping {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = memory::munmap(self.addr, self.size) {
                warn!(
                    "failed to undo stray mapping {}+{}: {}",
                    self.addr, self.size, err
                );
            }
        }
    }
}

/// Mediates address-space requests for one subsystem. Constructed once per
/// subsystem through [`crate::VmOs::address_space`]; holds the startup-queried
/// page-size table and reports every state change to NMT under its category.
pub struct AddressSpaceManager {
    tracker: Arc<NativeMemoryTracker>,
    category: MemoryCategory,
    page_sizes: Arc<PageSizeTable>,
    numa: Arc<NumaInterface>,
    /// Spread freshly committed memory across locality groups instead of
    /// leaving it wherever first touch lands.
    numa_interleave: bool,
}

impl AddressSpaceManager {
    pub fn new(
        tracker: Arc<NativeMemoryTracker>,
        category: MemoryCategory,
        page_sizes: Arc<PageSizeTable>,
        numa: Arc<NumaInterface>,
        numa_interleave: bool,
    ) -> Self {
        AddressSpaceManager {
            tracker,
            category,
            page_sizes,
            numa,
            numa_interleave,
        }
    }

    pub fn page_sizes(&self) -> &PageSizeTable {
        &self.page_sizes
    }

    pub fn numa(&self) -> &NumaInterface {
        &self.numa
    }

    /// Claim page-aligned address space anywhere the kernel likes. `None` is
    /// an ordinary, recoverable refusal.
    ///
    /// The mapping carries no access until committed; `exec_hint` only
    /// forewarns the platform that the range will eventually hold code, the
    /// actual mask is established by [`commit`](Self::commit).
    #[track_caller]
    pub fn reserve(&self, size: usize, exec_hint: bool) -> Option<AddressRegion> {
        let size = conversions::raw_align_up_page(size);
        match memory::mmap_reserve(Address::zero(), size) {
            Ok(addr) => {
                trace!("reserved {}+{} (exec_hint: {})", addr, size, exec_hint);
                self.tracker.record_reserve(self.category, size);
                Some(AddressRegion::reserved(addr, size))
            }
            Err(err) => {
                debug!("reservation of {} bytes refused: {}", size, err);
                None
            }
        }
    }

    /// Claim address space at exactly `addr`. If the kernel honors the hint
    /// somewhere else the stray mapping is fully unmapped and `None` is
    /// returned; a mapping never leaks.
    #[track_caller]
    pub fn reserve_at(&self, addr: Address, size: usize, exec_hint: bool) -> Option<AddressRegion> {
        debug_assert!(conversions::is_page_aligned(addr));
        let size = conversions::raw_align_up_page(size);
        let got = match memory::mmap_reserve(addr, size) {
            Ok(got) => got,
            Err(err) => {
                debug!("reservation at {} refused: {}", addr, err);
                return None;
            }
        };
        let mapping = RawMapping::new(got, size);
        if got != addr {
            // The guard unmaps the misplaced mapping when it drops here.
            debug!("reservation hint {} landed at {}, undone", addr, got);
            return None;
        }
        let addr = mapping.disarm();
        trace!("reserved {}+{} exactly (exec_hint: {})", addr, size, exec_hint);
        self.tracker.record_reserve(self.category, size);
        Some(AddressRegion::reserved(addr, size))
    }

    /// Back a reserved region with demand-zero memory.
    ///
    /// Kernel refusals the caller can reason about (bad range, unsupported)
    /// come back as `Err`; any other failure means the reservation itself can
    /// no longer be trusted and the process aborts with diagnostics.
    #[track_caller]
    pub fn commit(&self, region: &mut AddressRegion, exec: bool) -> std::io::Result<()> {
        #[cfg(feature = "extreme_assertions")]
        assert!(
            !region.is_committed(),
            "commit of already committed region {}",
            region.base()
        );
        let prot = if exec {
            Protection::ReadWriteExec
        } else {
            Protection::ReadWrite
        };
        match memory::mmap_commit(region.base(), region.size(), prot) {
            Ok(()) => {
                if self.numa_interleave {
                    self.numa.make_global(region.base(), region.size());
                }
                self.tracker.record_commit(self.category, region.size());
                region.set_committed(prot);
                Ok(())
            }
            Err(err) if memory::is_recoverable_mmap_error(&err) => {
                warn!(
                    "commit of {}+{} failed recoverably: {}",
                    region.base(),
                    region.size(),
                    err
                );
                Err(err)
            }
            Err(err) => self.handle_fatal_commit_error(region, err),
        }
    }

    /// As [`commit`](Self::commit), additionally attempting pages large enough
    /// to satisfy `alignment`. Failure to obtain large pages degrades silently
    /// to base pages.
    #[track_caller]
    pub fn commit_with_alignment(
        &self,
        region: &mut AddressRegion,
        alignment: usize,
        exec: bool,
    ) -> std::io::Result<()> {
        self.commit(region, exec)?;
        let page_size = self.page_sizes.page_size_for_alignment(alignment);
        if page_size > self.page_sizes.base() {
            if let Err(err) = memory::madvise_huge_pages(region.base(), region.size()) {
                debug!(
                    "large pages ({} bytes) unavailable for {}+{}, using base pages: {}",
                    page_size,
                    region.base(),
                    region.size(),
                    err
                );
            }
        }
        Ok(())
    }

    /// Change the access mask of a committed region (guard pages, read-only
    /// views). Protection is meaningful only while committed; calling this on
    /// a merely reserved region is a contract violation and is ignored in
    /// release builds.
    pub fn protect(&self, region: &mut AddressRegion, mode: Protection) -> std::io::Result<()> {
        if !region.is_committed() {
            debug_assert!(false, "protect on uncommitted region {}", region.base());
            return Ok(());
        }
        memory::mprotect(region.base(), region.size(), mode)?;
        region.set_committed(mode);
        Ok(())
    }

    /// Turn a committed region into a guard range that faults on any access.
    pub fn guard(&self, region: &mut AddressRegion) -> std::io::Result<()> {
        self.protect(region, Protection::NoAccess)
    }

    /// Lift a guard established by [`guard`](Self::guard).
    pub fn unguard(&self, region: &mut AddressRegion) -> std::io::Result<()> {
        self.protect(region, Protection::ReadWrite)
    }

    /// Return the backing store of a committed region while keeping the
    /// address space reserved. Advisory on some platforms: the pages are
    /// guaranteed inaccessible afterwards, but the kernel may reclaim them
    /// lazily.
    pub fn uncommit(&self, region: &mut AddressRegion) -> std::io::Result<()> {
        debug_assert!(region.is_committed());
        memory::mmap_uncommit(region.base(), region.size())?;
        self.tracker.record_uncommit(self.category, region.size());
        region.set_reserved();
        Ok(())
    }

    /// Return the region's address space to the kernel. Consumes the region
    /// so the range cannot be named afterwards. The tracker is charged only
    /// once the unmap succeeds, so its counters track real mappings.
    pub fn release(&self, region: AddressRegion) -> std::io::Result<()> {
        memory::munmap(region.base(), region.size())?;
        if region.is_committed() {
            self.tracker.record_uncommit(self.category, region.size());
        }
        self.tracker.record_release(self.category, region.size());
        Ok(())
    }

    fn handle_fatal_commit_error(&self, region: &AddressRegion, err: std::io::Error) -> ! {
        error!(
            "Failed to commit memory {}+{} ({} bytes): {}",
            region.base(),
            region.size(),
            region.size(),
            err
        );
        if memory::is_mmap_oom(&err) {
            error!("Out of memory while committing reserved memory.");
        }
        if let Ok(maps) = memory::get_process_memory_maps() {
            error!("Process memory maps:\n{}", maps);
        }
        let mut stderr = std::io::stderr();
        let _ = self.tracker.error_report(&mut stderr);
        std::process::abort()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmt::TrackingLevel;
    use crate::util::constants::{BYTES_IN_MBYTE, BYTES_IN_PAGE};
    use crate::util::test_util::{serial_test, TEST_ADDRESS};

    fn manager(level: TrackingLevel) -> AddressSpaceManager {
        AddressSpaceManager::new(
            Arc::new(NativeMemoryTracker::with_level(level)),
            MemoryCategory::Internal,
            Arc::new(PageSizeTable::query()),
            Arc::new(NumaInterface::query()),
            false,
        )
    }

    #[test]
    fn reserve_then_release_leaves_no_mapping() {
        serial_test(|| {
            let asm = manager(TrackingLevel::Off);
            let region = asm.reserve_at(TEST_ADDRESS, 4 * BYTES_IN_PAGE, false).unwrap();
            assert_eq!(region.base(), TEST_ADDRESS);
            asm.release(region).unwrap();
            // The exact range must be claimable again: no residual mapping.
            let region = asm.reserve_at(TEST_ADDRESS, 4 * BYTES_IN_PAGE, false).unwrap();
            asm.release(region).unwrap();
        });
    }

    #[test]
    fn commit_uncommit_commit() {
        serial_test(|| {
            let asm = manager(TrackingLevel::Summary);
            let mut region = asm.reserve(BYTES_IN_PAGE, false).unwrap();
            asm.commit(&mut region, false).unwrap();
            unsafe { region.base().store(0xdeadusize) };
            asm.uncommit(&mut region).unwrap();
            assert!(!region.is_committed());
            // The second commit must not fail due to residue from the first,
            // and must hand back demand-zero pages.
            asm.commit(&mut region, false).unwrap();
            assert_eq!(unsafe { region.base().load::<usize>() }, 0);
            asm.release(region).unwrap();
        });
    }

    #[test]
    fn commit_with_alignment_degrades_to_base_pages() {
        serial_test(|| {
            let asm = manager(TrackingLevel::Summary);
            let alignment = 2 * BYTES_IN_MBYTE;
            let mut region = asm.reserve(alignment, false).unwrap();
            // Succeeds whether or not the host supports a page size dividing
            // the alignment; without one the advice is skipped or refused and
            // base pages back the region.
            asm.commit_with_alignment(&mut region, alignment, false).unwrap();
            assert!(region.is_committed());
            unsafe { region.base().store(0x5ca1ab1eusize) };
            assert_eq!(unsafe { region.base().load::<usize>() }, 0x5ca1ab1e);
            // The end of the range is usable too.
            let last = region.end() - crate::util::constants::BYTES_IN_ADDRESS;
            unsafe { last.store(1usize) };
            asm.uncommit(&mut region).unwrap();
            asm.release(region).unwrap();
        });
    }

    #[test]
    fn reserve_rounds_up_to_page() {
        serial_test(|| {
            let asm = manager(TrackingLevel::Off);
            let region = asm.reserve(1, false).unwrap();
            assert_eq!(region.size(), BYTES_IN_PAGE);
            asm.release(region).unwrap();
        });
    }

    #[test]
    fn protect_requires_commit() {
        serial_test(|| {
            let asm = manager(TrackingLevel::Off);
            let mut region = asm.reserve(BYTES_IN_PAGE, false).unwrap();
            asm.commit(&mut region, false).unwrap();
            asm.protect(&mut region, Protection::ReadOnly).unwrap();
            assert_eq!(region.protection(), Some(Protection::ReadOnly));
            // Reading through a read-only page still works.
            assert_eq!(unsafe { region.base().load::<usize>() }, 0);
            asm.unguard(&mut region).unwrap();
            assert_eq!(region.protection(), Some(Protection::ReadWrite));
            asm.release(region).unwrap();
        });
    }

    #[test]
    fn reservation_reports_to_tracker() {
        serial_test(|| {
            let tracker = Arc::new(NativeMemoryTracker::with_level(TrackingLevel::Summary));
            let asm = AddressSpaceManager::new(
                tracker.clone(),
                MemoryCategory::Gc,
                Arc::new(PageSizeTable::query()),
                Arc::new(NumaInterface::query()),
                false,
            );
            let mut region = asm.reserve(2 * BYTES_IN_PAGE, false).unwrap();
            asm.commit(&mut region, false).unwrap();
            let baseline = tracker.baseline();
            assert_eq!(baseline.category(MemoryCategory::Gc).reserved, 2 * BYTES_IN_PAGE);
            assert_eq!(baseline.category(MemoryCategory::Gc).committed, 2 * BYTES_IN_PAGE);
            asm.uncommit(&mut region).unwrap();
            asm.release(region).unwrap();
            let baseline = tracker.baseline();
            assert_eq!(baseline.category(MemoryCategory::Gc).reserved, 0);
            assert_eq!(baseline.category(MemoryCategory::Gc).committed, 0);
        });
    }

    #[test]
    fn release_of_committed_region_settles_both_counters() {
        serial_test(|| {
            let tracker = Arc::new(NativeMemoryTracker::with_level(TrackingLevel::Summary));
            let asm = AddressSpaceManager::new(
                tracker.clone(),
                MemoryCategory::Code,
                Arc::new(PageSizeTable::query()),
                Arc::new(NumaInterface::query()),
                false,
            );
            let mut region = asm.reserve(BYTES_IN_PAGE, false).unwrap();
            asm.commit(&mut region, false).unwrap();
            // Releasing without an explicit uncommit still retires the
            // committed bytes alongside the reservation.
            asm.release(region).unwrap();
            let baseline = tracker.baseline();
            assert_eq!(baseline.category(MemoryCategory::Code).reserved, 0);
            assert_eq!(baseline.category(MemoryCategory::Code).committed, 0);
        });
    }
}
