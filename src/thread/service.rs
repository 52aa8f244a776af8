//! Thread creation and priority application.

use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::native_thread::{NativeThread, ThreadState};
use super::priority::{PriorityOutcome, PriorityPolicy, VmPriority};
use super::ThreadKind;
use crate::address_space::{AddressSpaceManager, NumaInterface, PageSizeTable};
use crate::nmt::{MemoryCategory, NativeMemoryTracker};
use crate::util::constants::{BYTES_IN_GBYTE, BYTES_IN_MBYTE};
use crate::util::conversions;

/// Reserved-and-released before creating past the soft ceiling. Large enough
/// that success means one more stack will still map.
const PROBE_BYTES: usize = 20 * BYTES_IN_MBYTE;

/// Address space assumed available for stacks when deriving the soft thread
/// ceiling, capped for processes on machines with more memory than a single
/// process can sensibly dedicate to stacks.
const STACK_BUDGET_CAP: usize = 4 * BYTES_IN_GBYTE;
const STACK_BUDGET_SLACK: usize = 200 * BYTES_IN_MBYTE;

/// Creates OS threads bound to VM thread objects and applies VM-scale
/// priorities to them.
///
/// Threads come up suspended: the new thread records its native identifiers,
/// then blocks until [`start`](Self::start), so the creator can finish its
/// bookkeeping before any managed code runs.
pub struct NativeThreadService {
    policy: Arc<PriorityPolicy>,
    address_space: AddressSpaceManager,
    numa: Arc<NumaInterface>,
    live: Arc<AtomicUsize>,
    next_id: AtomicU64,
    /// Creating past this many live threads requires the address-space probe
    /// to succeed first.
    soft_ceiling: usize,
}

impl NativeThreadService {
    pub fn new(
        tracker: Arc<NativeMemoryTracker>,
        page_sizes: Arc<PageSizeTable>,
        numa: Arc<NumaInterface>,
    ) -> Self {
        let soft_ceiling = derive_soft_ceiling(ThreadKind::Java.min_stack_size());
        debug!("soft thread ceiling: {}", soft_ceiling);
        NativeThreadService {
            policy: Arc::new(PriorityPolicy::probe()),
            address_space: AddressSpaceManager::new(
                tracker,
                MemoryCategory::ThreadStack,
                page_sizes,
                numa.clone(),
                false,
            ),
            numa,
            live: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(1),
            soft_ceiling,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_soft_ceiling(mut self, ceiling: usize) -> Self {
        self.soft_ceiling = ceiling;
        self
    }

    pub fn live_threads(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn soft_ceiling(&self) -> usize {
        self.soft_ceiling
    }

    pub fn sched_class(&self) -> super::SchedClass {
        self.policy.class()
    }

    /// Create a thread of the given kind, suspended on its start latch.
    ///
    /// The stack is the larger of `requested_stack_size` and the kind's floor.
    /// Past the soft ceiling, creation first probes address space by reserving
    /// and releasing a large dummy block; a failed probe refuses creation as
    /// an ordinary error. `entry` runs only after [`start`](Self::start).
    pub fn create<F>(
        &self,
        kind: ThreadKind,
        requested_stack_size: usize,
        vm_thread: crate::util::VMThread,
        entry: F,
    ) -> io::Result<Arc<NativeThread>>
    where
        F: FnOnce(&NativeThread) + Send + 'static,
    {
        let stack_size =
            conversions::raw_align_up_page(requested_stack_size.max(kind.min_stack_size()));

        if self.live.load(Ordering::Relaxed) >= self.soft_ceiling {
            match self.address_space.reserve(PROBE_BYTES, false) {
                Some(region) => {
                    self.address_space.release(region)?;
                }
                None => {
                    warn!(
                        "refusing {} thread: address-space probe failed past \
                         ceiling of {} threads",
                        kind.name(),
                        self.soft_ceiling
                    );
                    return Err(io::Error::new(
                        io::ErrorKind::OutOfMemory,
                        "address space exhausted near thread ceiling",
                    ));
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let thread = Arc::new(NativeThread::new(id, kind, stack_size, vm_thread));
        let policy = self.policy.clone();
        let numa = self.numa.clone();
        let live = self.live.clone();
        let me = thread.clone();

        self.live.fetch_add(1, Ordering::Relaxed);
        let spawned = std::thread::Builder::new()
            .name(format!("{}-{}", kind.name(), id))
            .stack_size(stack_size)
            .spawn(move || {
                me.set_sched_unit_id(current_unit_id());
                me.set_numa_group(numa.current_group_id() as i64);
                me.set_state(ThreadState::Initialized);
                me.wait_for_start();
                me.set_state(ThreadState::Runnable);
                // A priority request that raced thread creation was parked in
                // the deferred slot; it is applied here, on the thread itself,
                // now that the scheduling-unit id exists.
                if let Some(raw) = me.take_deferred_priority() {
                    if let Some(prio) = VmPriority::from_raw(raw) {
                        policy.apply(me.sched_unit_id(), prio);
                        me.set_native_priority(policy.native_for(prio) as i32);
                    }
                }
                // The guard retires the thread whichever way entry exits; a
                // panicking entry must not leak the live count the soft
                // ceiling gates on.
                let _exit = ThreadExitGuard {
                    thread: me.as_ref(),
                    live: live.as_ref(),
                };
                entry(&me);
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                self.live.fetch_sub(1, Ordering::Relaxed);
                return Err(err);
            }
        };
        thread.bind_join_handle(handle);
        trace!("created {} thread {} (stack {} bytes)", kind.name(), id, stack_size);
        Ok(thread)
    }

    /// Release a thread created suspended. Idempotent.
    pub fn start(&self, thread: &NativeThread) {
        thread.release_start_latch();
    }

    /// Apply a VM priority to a thread.
    ///
    /// Before the thread's scheduling-unit id is known the request is
    /// remembered and replayed by the thread itself once it runs; it is never
    /// dropped and never blocks the caller.
    pub fn set_priority(&self, thread: &NativeThread, prio: VmPriority) -> PriorityOutcome {
        let unit_id = thread.sched_unit_id();
        if unit_id < 0 {
            thread.defer_priority(prio.to_raw());
            // The id may have appeared while we stored; if the thread already
            // passed its replay point nobody would ever consume the slot, so
            // take it back and apply directly.
            let unit_id = thread.sched_unit_id();
            if unit_id >= 0 {
                if let Some(raw) = thread.take_deferred_priority() {
                    if let Some(prio) = VmPriority::from_raw(raw) {
                        return self.apply_now(thread, unit_id, prio);
                    }
                }
            }
            return PriorityOutcome::Deferred;
        }
        self.apply_now(thread, unit_id, prio)
    }

    fn apply_now(&self, thread: &NativeThread, unit_id: i64, prio: VmPriority) -> PriorityOutcome {
        let outcome = self.policy.apply(unit_id, prio);
        thread.set_native_priority(self.policy.native_for(prio) as i32);
        outcome
    }

    /// Wait for a thread to terminate. A second join is a no-op.
    pub fn join(&self, thread: &NativeThread) {
        if let Some(handle) = thread.take_join_handle() {
            if handle.join().is_err() {
                warn!("thread {} terminated by panic", thread.id());
            }
        }
    }
}

/// Marks a thread terminated and releases its slot in the live count when the
/// entry function returns, including by unwinding.
struct ThreadExitGuard<'a> {
    thread: &'a NativeThread,
    live: &'a AtomicUsize,
}

impl Drop for ThreadExitGuard<'_> {
    fn drop(&mut self) {
        self.thread.set_state(ThreadState::Terminated);
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Live threads the process can plausibly give a stack each, derived from
/// physical memory capped to what one process can map for stacks.
fn derive_soft_ceiling(default_stack: usize) -> usize {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    let total = sys.total_memory() as usize;
    let budget = total.min(STACK_BUDGET_CAP).saturating_sub(STACK_BUDGET_SLACK);
    (budget / default_stack).max(1)
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn current_unit_id() -> i64 {
            unsafe { libc::syscall(libc::SYS_gettid) as i64 }
        }
    } else if #[cfg(target_os = "macos")] {
        fn current_unit_id() -> i64 {
            let mut tid: u64 = 0;
            unsafe { libc::pthread_threadid_np(std::ptr::null_mut(), &mut tid) };
            tid as i64
        }
    } else {
        fn current_unit_id() -> i64 {
            0
        }
    }
}
