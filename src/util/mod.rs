//! Shared low-level utilities used by all components.

pub mod address;
pub mod constants;
pub mod conversions;
pub mod logger;
pub mod memory;
pub mod opaque_pointer;

#[cfg(test)]
pub(crate) mod test_util;

pub use address::Address;
pub use opaque_pointer::{OpaquePointer, VMThread};
