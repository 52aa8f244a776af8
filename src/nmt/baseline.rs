use enum_map::EnumMap;

use super::{CallSite, MemoryCategory, TrackingLevel};

/// Per-category slice of a [`MemoryBaseline`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CategorySnapshot {
    pub reserved: usize,
    pub committed: usize,
    pub malloc_bytes: usize,
    pub malloc_count: usize,
}

#[derive(Debug, Copy, Clone)]
pub(super) struct SiteSnapshot {
    pub(super) site: CallSite,
    pub(super) category: MemoryCategory,
    pub(super) reserved: usize,
    pub(super) count: usize,
}

/// An immutable snapshot of tracked allocations at one point in time. Built on
/// demand, used to render a report or to diff against an earlier snapshot, and
/// discarded afterwards.
pub struct MemoryBaseline {
    pub(super) level: TrackingLevel,
    pub(super) by_category: EnumMap<MemoryCategory, CategorySnapshot>,
    pub(super) sites: Vec<SiteSnapshot>,
}

impl MemoryBaseline {
    pub(super) fn new(
        level: TrackingLevel,
        by_category: EnumMap<MemoryCategory, CategorySnapshot>,
        sites: Vec<SiteSnapshot>,
    ) -> Self {
        MemoryBaseline {
            level,
            by_category,
            sites,
        }
    }

    pub fn level(&self) -> TrackingLevel {
        self.level
    }

    pub fn category(&self, category: MemoryCategory) -> CategorySnapshot {
        self.by_category[category]
    }

    pub fn total_reserved(&self) -> usize {
        self.by_category.values().map(|c| c.reserved).sum()
    }

    pub fn total_committed(&self) -> usize {
        self.by_category.values().map(|c| c.committed).sum()
    }

    pub fn total_malloc(&self) -> usize {
        self.by_category.values().map(|c| c.malloc_bytes).sum()
    }

    pub fn site_count(&self) -> usize {
        self.sites.len()
    }

    /// Diff this (later) baseline against an earlier one.
    pub fn diff(&self, earlier: &MemoryBaseline) -> BaselineDiff {
        let mut by_category: EnumMap<MemoryCategory, CategoryDelta> = EnumMap::default();
        for (category, later) in self.by_category.iter() {
            let before = earlier.by_category[category];
            by_category[category] = CategoryDelta {
                reserved: later.reserved as i64 - before.reserved as i64,
                committed: later.committed as i64 - before.committed as i64,
                malloc_bytes: later.malloc_bytes as i64 - before.malloc_bytes as i64,
            };
        }
        BaselineDiff { by_category }
    }
}

#[derive(Debug, Default, Copy, Clone)]
struct CategoryDelta {
    reserved: i64,
    committed: i64,
    malloc_bytes: i64,
}

/// The difference between two baselines, by category.
pub struct BaselineDiff {
    by_category: EnumMap<MemoryCategory, CategoryDelta>,
}

impl BaselineDiff {
    pub fn reserved_delta(&self, category: MemoryCategory) -> i64 {
        self.by_category[category].reserved
    }

    pub fn committed_delta(&self, category: MemoryCategory) -> i64 {
        self.by_category[category].committed
    }

    pub fn malloc_delta(&self, category: MemoryCategory) -> i64 {
        self.by_category[category].malloc_bytes
    }
}
