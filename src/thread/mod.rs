//! Native thread creation, scheduling and lifecycle.

mod native_thread;
mod priority;
mod service;

pub use native_thread::{NativeThread, ThreadState};
pub use priority::{
    scale_to_class, ClassLimits, PriorityOutcome, PriorityPolicy, PriorityTable, SchedClass,
    VmPriority,
};
pub use service::NativeThreadService;

use crate::util::constants::{BYTES_IN_KBYTE, BYTES_IN_MBYTE};

/// What a thread is for. The kind decides its stack floor and its name; it
/// never changes after creation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ThreadKind {
    /// The VM's own coordinator thread.
    Vm,
    /// Concurrent GC work alongside mutators.
    GcConcurrent,
    /// Parallel GC work inside pauses.
    GcParallel,
    /// A mutator running managed code.
    Java,
    /// JIT compilation. Recursive compiler passes need far deeper stacks than
    /// anything else in the VM.
    Compiler,
    /// Periodic housekeeping.
    Watcher,
}

impl ThreadKind {
    /// The smallest stack this kind can run on. Requests below the floor are
    /// raised to it.
    pub fn min_stack_size(self) -> usize {
        match self {
            ThreadKind::Vm | ThreadKind::Java => BYTES_IN_MBYTE,
            ThreadKind::GcConcurrent | ThreadKind::GcParallel => 512 * BYTES_IN_KBYTE,
            ThreadKind::Compiler => 4 * BYTES_IN_MBYTE,
            ThreadKind::Watcher => 256 * BYTES_IN_KBYTE,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ThreadKind::Vm => "vm",
            ThreadKind::GcConcurrent => "gc-concurrent",
            ThreadKind::GcParallel => "gc-parallel",
            ThreadKind::Java => "java",
            ThreadKind::Compiler => "compiler",
            ThreadKind::Watcher => "watcher",
        }
    }
}
