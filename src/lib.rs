//! VMOS is the operating-system abstraction layer underneath a managed-language
//! virtual machine. It provides a uniform surface for the four primitives every
//! other VM subsystem depends on:
//!
//! * Address-space management ([`address_space`]): reserving, committing,
//!   protecting and releasing page-aligned address ranges, including large-page
//!   selection and NUMA placement hints.
//! * Native thread lifecycle and scheduling ([`thread`]): creating OS threads
//!   bound to VM thread objects, and mapping the VM priority scale onto the
//!   kernel's scheduling classes.
//! * Low-level blocking and waking ([`park`]): the per-thread ternary
//!   park/unpark primitive from which all higher-level VM locks and waits are
//!   built.
//! * Native memory tracking ([`nmt`]): process-wide accounting of every
//!   reservation, commit and release the VM itself performs, with baselines
//!   and diagnostic reports.
//!
//! All services are instance state owned by a single [`VmOs`] object
//! constructed once at startup; there are no process-wide mutable singletons.
//! The tracking level must be fixed before the first tracked allocation, so
//! [`VmOs::new`] resolves it from the environment before anything else runs.

extern crate libc;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

pub mod address_space;
pub mod nmt;
pub mod park;
pub mod thread;
pub mod util;

mod vmos;

pub use crate::vmos::VmOs;
