use crate::util::conversions;
use crate::util::memory::Protection;
use crate::util::Address;

/// Where an [`AddressRegion`] is in its life. A released region does not
/// appear here: releasing consumes the region value, so a released range
/// cannot be named again.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegionState {
    /// Address space claimed, no backing store.
    Reserved,
    /// Backed by memory, accessible according to the mask.
    Committed(Protection),
}

/// A contiguous page-aligned range of address space, tracked through its
/// reserve/commit/protect life cycle.
///
/// Regions are exclusively owned by the requesting subsystem (heap, code
/// cache, thread stack). The [`AddressSpaceManager`](super::AddressSpaceManager)
/// mediates every state change but never retains ownership; it hands the
/// region out by value on reservation and takes it back by value on release.
#[derive(Debug)]
pub struct AddressRegion {
    base: Address,
    size: usize,
    state: RegionState,
}

impl AddressRegion {
    pub(super) fn reserved(base: Address, size: usize) -> Self {
        debug_assert!(conversions::is_page_aligned(base));
        debug_assert!(conversions::raw_is_aligned(
            size,
            crate::util::constants::BYTES_IN_PAGE
        ));
        AddressRegion {
            base,
            size,
            state: RegionState::Reserved,
        }
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> Address {
        self.base + self.size
    }

    pub fn state(&self) -> RegionState {
        self.state
    }

    pub fn is_committed(&self) -> bool {
        matches!(self.state, RegionState::Committed(_))
    }

    /// The current access mask, meaningful only while committed.
    pub fn protection(&self) -> Option<Protection> {
        match self.state {
            RegionState::Committed(prot) => Some(prot),
            RegionState::Reserved => None,
        }
    }

    pub(super) fn set_committed(&mut self, prot: Protection) {
        self.state = RegionState::Committed(prot);
    }

    pub(super) fn set_reserved(&mut self) {
        self.state = RegionState::Reserved;
    }
}
