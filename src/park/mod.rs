//! Thread parking primitives.
//!
//! Two layers share one protocol. [`ParkEvent`] is the low-level blocking
//! point used internally by the runtime: parks can only be lost to wakeups,
//! never to time alone unless asked. [`Parker`] wraps an event with the
//! semantics managed code expects from `LockSupport.park`: a single sticky
//! permit, spurious returns allowed, interrupt-aware.
//!
//! Both keep a ternary counter: -1 a waiter is (about to be) blocked, 0
//! neutral, 1 a wakeup is pending. Unparking an event nobody is parked on
//! stores the permit for the next park, which then returns immediately.
//! Wakers hand over the permit with a single atomic swap and only take the
//! mutex when a waiter might actually be blocked, so the fast path stays
//! lock-free.

mod event;
mod parker;
mod time;

pub use event::{ParkEvent, WaitResult};
pub use parker::Parker;
pub use time::{elapsed_nanos, ParkTime};
