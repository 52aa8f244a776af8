//! Native Memory Tracking (NMT).
//!
//! Process-wide accounting of the native memory the VM itself reserves,
//! commits and mallocs. Every tracked call site gates on a single-word atomic
//! read of the [`TrackingLevel`]; the level is fixed from the environment
//! before the first tracked allocation and can only ever move downward.

mod baseline;
mod report;
mod tracker;
mod tracking_level;

pub use baseline::{BaselineDiff, CategorySnapshot, MemoryBaseline};
pub use tracker::NativeMemoryTracker;
pub use tracking_level::TrackingLevel;

use enum_map::Enum;

/// What a tracked allocation is for. Closed set; a category is encoded into a
/// single byte in tracking headers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Enum)]
pub enum MemoryCategory {
    /// The managed heap itself.
    JavaHeap,
    /// Class metadata.
    Class,
    /// Thread bookkeeping structures.
    Thread,
    /// Thread stacks and their guard pages.
    ThreadStack,
    /// The code cache.
    Code,
    /// Garbage collector internal structures.
    Gc,
    /// JIT compiler working memory.
    Compiler,
    /// VM-internal allocations that fit no other category.
    Internal,
    /// Everything else.
    Other,
}

static_assertions::const_assert!(MemoryCategory::LENGTH <= u8::MAX as usize);

impl MemoryCategory {
    pub fn name(&self) -> &'static str {
        match self {
            MemoryCategory::JavaHeap => "Java Heap",
            MemoryCategory::Class => "Class",
            MemoryCategory::Thread => "Thread",
            MemoryCategory::ThreadStack => "Thread Stack",
            MemoryCategory::Code => "Code",
            MemoryCategory::Gc => "GC",
            MemoryCategory::Compiler => "Compiler",
            MemoryCategory::Internal => "Internal",
            MemoryCategory::Other => "Other",
        }
    }
}

/// A tracked call site, captured through `#[track_caller]` at the recording
/// functions. Only meaningful at [`TrackingLevel::Detail`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CallSite {
    pub file: &'static str,
    pub line: u32,
}

impl CallSite {
    #[track_caller]
    pub fn caller() -> Self {
        let loc = std::panic::Location::caller();
        CallSite {
            file: loc.file(),
            line: loc.line(),
        }
    }
}

impl std::fmt::Display for CallSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}
