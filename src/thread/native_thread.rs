//! The per-thread record binding an OS thread to a VM thread object.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::JoinHandle;

use atomic::Atomic;
use bytemuck::NoUninit;

use super::ThreadKind;
use crate::park::{ParkEvent, Parker};
use crate::util::opaque_pointer::VMThread;

/// Where a thread is in its life. Allocated on record creation, Initialized
/// once the thread runs far enough to know its native identifiers, Runnable
/// only after the creator explicitly releases it, Terminated when the entry
/// function returns.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, NoUninit)]
pub enum ThreadState {
    Allocated,
    Initialized,
    Runnable,
    Terminated,
}

/// No priority request outstanding.
const PENDING_NONE: i32 = -1;

/// One OS thread bound to one VM thread object.
///
/// Created suspended: the underlying thread records its identifiers, then
/// blocks on the start latch until [`super::NativeThreadService::start`]
/// releases it. Mutated by the creator before start and by the thread itself
/// afterwards.
pub struct NativeThread {
    id: u64,
    kind: ThreadKind,
    stack_size: usize,
    vm_thread: VMThread,
    state: Atomic<ThreadState>,
    /// Kernel scheduling-unit id, -1 until the thread actually runs.
    sched_unit_id: AtomicI64,
    /// NUMA group the thread first ran on, meaningful once initialized.
    numa_group: AtomicI64,
    /// A priority request that arrived before the unit id was known, encoded
    /// per [`crate::thread::VmPriority::to_raw`]. Replayed by the thread.
    pending_priority: AtomicI32,
    /// The last 0..=127 native priority applied, -1 before the first.
    native_priority: AtomicI32,
    interrupted: AtomicBool,
    /// The thread is inside a parker wait.
    blocked: AtomicBool,
    park_event: ParkEvent,
    parker: Parker,
    start_latch: Mutex<bool>,
    start_cond: Condvar,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl NativeThread {
    pub(super) fn new(id: u64, kind: ThreadKind, stack_size: usize, vm_thread: VMThread) -> Self {
        NativeThread {
            id,
            kind,
            stack_size,
            vm_thread,
            state: Atomic::new(ThreadState::Allocated),
            sched_unit_id: AtomicI64::new(-1),
            numa_group: AtomicI64::new(-1),
            pending_priority: AtomicI32::new(PENDING_NONE),
            native_priority: AtomicI32::new(-1),
            interrupted: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            park_event: ParkEvent::new(),
            parker: Parker::new(),
            start_latch: Mutex::new(false),
            start_cond: Condvar::new(),
            join_handle: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn vm_thread(&self) -> VMThread {
        self.vm_thread
    }

    pub fn state(&self) -> ThreadState {
        self.state.load(Ordering::Acquire)
    }

    pub(super) fn set_state(&self, state: ThreadState) {
        self.state.store(state, Ordering::Release);
    }

    /// The kernel scheduling-unit id, or -1 while the thread has not run yet.
    pub fn sched_unit_id(&self) -> i64 {
        self.sched_unit_id.load(Ordering::Acquire)
    }

    pub(super) fn set_sched_unit_id(&self, id: i64) {
        self.sched_unit_id.store(id, Ordering::Release);
    }

    /// The NUMA group the thread first ran on, or -1 before that.
    pub fn numa_group(&self) -> i64 {
        self.numa_group.load(Ordering::Relaxed)
    }

    pub(super) fn set_numa_group(&self, group: i64) {
        self.numa_group.store(group, Ordering::Relaxed);
    }

    /// Remember a priority request for replay. Requests overwrite, the last
    /// one wins.
    pub(super) fn defer_priority(&self, raw: i32) {
        self.pending_priority.store(raw, Ordering::Release);
    }

    /// Take the deferred priority request, if any. Consuming, a request is
    /// replayed once.
    pub(super) fn take_deferred_priority(&self) -> Option<i32> {
        let raw = self.pending_priority.swap(PENDING_NONE, Ordering::AcqRel);
        (raw != PENDING_NONE).then_some(raw)
    }

    /// The last native-scale priority applied to this thread, or -1 if none
    /// has been yet.
    pub fn native_priority(&self) -> i32 {
        self.native_priority.load(Ordering::Relaxed)
    }

    pub(super) fn set_native_priority(&self, native: i32) {
        self.native_priority.store(native, Ordering::Relaxed);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Set or clear the interrupt flag. Parkers poll it before and after
    /// blocking; setting it does not cancel an in-flight kernel wait, pair it
    /// with an unpark for that.
    pub fn set_interrupted(&self, value: bool) {
        self.interrupted.store(value, Ordering::Release);
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    pub(crate) fn block_guard(&self) -> ThreadBlockGuard<'_> {
        self.blocked.store(true, Ordering::Release);
        ThreadBlockGuard { thread: self }
    }

    /// The thread's internal blocking point.
    pub fn park_event(&self) -> &ParkEvent {
        &self.park_event
    }

    /// The thread's managed-code parker.
    pub fn parker(&self) -> &Parker {
        &self.parker
    }

    pub(super) fn wait_for_start(&self) {
        let mut started = self.start_latch.lock().unwrap();
        while !*started {
            started = self.start_cond.wait(started).unwrap();
        }
    }

    pub(super) fn release_start_latch(&self) {
        let mut started = self.start_latch.lock().unwrap();
        *started = true;
        self.start_cond.notify_all();
    }

    pub(super) fn bind_join_handle(&self, handle: JoinHandle<()>) {
        *self.join_handle.lock().unwrap() = Some(handle);
    }

    pub(super) fn take_join_handle(&self) -> Option<JoinHandle<()>> {
        self.join_handle.lock().unwrap().take()
    }

    #[cfg(test)]
    pub(crate) fn test_stub() -> Self {
        NativeThread::new(0, ThreadKind::Java, 0, VMThread::UNINITIALIZED)
    }
}

/// Marks a thread blocked for the duration of a wait, whatever way the wait
/// exits.
pub(crate) struct ThreadBlockGuard<'a> {
    thread: &'a NativeThread,
}

impl Drop for ThreadBlockGuard<'_> {
    fn drop(&mut self) {
        self.thread.blocked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_priority_is_consumed_once() {
        let thread = NativeThread::test_stub();
        assert_eq!(thread.take_deferred_priority(), None);
        thread.defer_priority(7);
        thread.defer_priority(9);
        // Last request wins, and it is replayed exactly once.
        assert_eq!(thread.take_deferred_priority(), Some(9));
        assert_eq!(thread.take_deferred_priority(), None);
    }

    #[test]
    fn block_guard_clears_on_drop() {
        let thread = NativeThread::test_stub();
        assert!(!thread.is_blocked());
        {
            let _guard = thread.block_guard();
            assert!(thread.is_blocked());
        }
        assert!(!thread.is_blocked());
    }
}
