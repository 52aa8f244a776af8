//! Helpers shared by tests that touch real OS state.

use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::util::Address;

// An address known to be unused by the test binary, for tests that need an
// exact placement.
#[cfg(target_os = "macos")]
pub const TEST_ADDRESS: Address = unsafe { Address::from_usize(0x2_0000_0000) };
#[cfg(not(target_os = "macos"))]
pub const TEST_ADDRESS: Address = unsafe { Address::from_usize(0x7000_0000) };

lazy_static! {
    // A global lock to make mmap-touching tests serial, so tests do not race
    // on overlapping address ranges.
    static ref SERIAL_TEST_LOCK: Mutex<()> = Mutex::default();
}

// force some tests to be executed serially
pub fn serial_test<F>(f: F)
where
    F: FnOnce(),
{
    // If one test fails, the lock will become poisoned. We would want to continue for other tests anyway.
    let _guard = SERIAL_TEST_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    f();
}

// Fail a blocking test if it does not finish in time, instead of hanging the
// whole test run. https://github.com/rust-lang/rfcs/issues/2798
pub fn panic_after<T, F>(millis: u64, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T,
    F: Send + 'static,
{
    let (done_tx, done_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let val = f();
        done_tx.send(()).expect("Unable to send completion signal");
        val
    });

    match done_rx.recv_timeout(Duration::from_millis(millis)) {
        Ok(_) => handle.join().expect("Thread panicked"),
        Err(e) => panic!("Thread took too long: {}", e),
    }
}
