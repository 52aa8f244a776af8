//! Raw wrappers around the kernel's memory facilities.
//!
//! Everything here speaks libc directly and reports failures as
//! `std::io::Error` carrying the raw errno. Classification of those errors
//! into the crate's failure taxonomy (recoverable refusal vs. fatal
//! exhaustion) happens in [`crate::address_space`]; raw OS codes never leak
//! past that boundary except inside logged diagnostics.

use crate::util::Address;
use std::io::{Error, Result};

/// Access mask for a committed region. This is a closed set: the manager never
/// hands out write-only or exec-only mappings.
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Protection {
    /// Do not allow any access
    NoAccess,
    /// Allow read
    ReadOnly,
    /// Allow read + write
    ReadWrite,
    /// Allow read + write + code execution
    ReadWriteExec,
}

impl Protection {
    pub(crate) fn into_native_flags(self) -> libc::c_int {
        use libc::{PROT_EXEC, PROT_NONE, PROT_READ, PROT_WRITE};
        match self {
            Self::NoAccess => PROT_NONE,
            Self::ReadOnly => PROT_READ,
            Self::ReadWrite => PROT_READ | PROT_WRITE,
            Self::ReadWriteExec => PROT_READ | PROT_WRITE | PROT_EXEC,
        }
    }
}

pub fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

fn mmap(start: Address, size: usize, prot: libc::c_int, flags: libc::c_int) -> Result<Address> {
    let res = unsafe { libc::mmap(start.to_mut_ptr(), size, prot, flags, -1, 0) };
    if res == libc::MAP_FAILED {
        Err(Error::last_os_error())
    } else {
        Ok(Address::from_mut_ptr(res))
    }
}

/// Reserve address space without charging swap. The mapping is PROT_NONE so an
/// accidental touch of uncommitted memory faults early instead of silently
/// succeeding when enough swap happens to be available.
///
/// `hint` may be zero (let the kernel place the mapping) or a preferred
/// address. The kernel is free to place the mapping elsewhere; the returned
/// address is where it actually landed.
pub fn mmap_reserve(hint: Address, size: usize) -> Result<Address> {
    let flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_NORESERVE;
    mmap(hint, size, libc::PROT_NONE, flags)
}

/// Back a previously reserved range with demand-zero pages at the given
/// protection. This overlays the reservation with MAP_FIXED, which is safe
/// because the caller owns the range.
pub fn mmap_commit(start: Address, size: usize, prot: Protection) -> Result<()> {
    let flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_FIXED;
    mmap(start, size, prot.into_native_flags(), flags).map(|_| ())
}

/// Return the backing store of a committed range while keeping the address
/// space reserved. The range is overlaid PROT_NONE + NORESERVE, so a later
/// touch faults and no swap stays charged.
pub fn mmap_uncommit(start: Address, size: usize) -> Result<()> {
    let flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_FIXED | libc::MAP_NORESERVE;
    mmap(start, size, libc::PROT_NONE, flags).map(|_| ())
}

pub fn munmap(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
}

pub fn mprotect(start: Address, size: usize, prot: Protection) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::mprotect(start.to_mut_ptr(), size, prot.into_native_flags()) },
        0,
    )
}

/// Errors the caller is allowed to handle. The list comes from the mmap(2) man
/// page; any other errno can mean our reserved mapping was lost, and different
/// subsystems could then believe they own the same memory.
pub fn is_recoverable_mmap_error(err: &Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EBADF) | Some(libc::EINVAL) | Some(libc::ENOTSUP)
    )
}

/// Check whether the given error indicates an out-of-memory condition.
pub fn is_mmap_oom(err: &Error) -> bool {
    err.kind() == std::io::ErrorKind::OutOfMemory || err.raw_os_error() == Some(libc::ENOMEM)
}

/// Advise the kernel to back the range with transparent huge pages.
/// Fallback: platforms without the advice simply keep base pages.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn madvise_huge_pages(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::madvise(start.to_mut_ptr(), size, libc::MADV_HUGEPAGE) },
        0,
    )
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn madvise_huge_pages(_start: Address, _size: usize) -> Result<()> {
    Ok(())
}

/// Get the memory maps for the process. The returned string is a multi-line
/// string. This is only meant to be used for diagnostics, e.g. logging the
/// process memory maps after a commit failure.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn get_process_memory_maps() -> Result<String> {
    use std::fs::File;
    use std::io::Read;
    let mut data = String::new();
    let mut f = File::open("/proc/self/maps")?;
    f.read_to_string(&mut data)?;
    Ok(data)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn get_process_memory_maps() -> Result<String> {
    Ok("(process memory maps unavailable on this platform)".to_string())
}

/// The base page size reported by the kernel.
pub fn vm_page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    debug_assert!(sz > 0);
    sz as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_PAGE;
    use crate::util::test_util::serial_test;

    #[test]
    fn reserve_commit_touch_release() {
        serial_test(|| {
            let addr = mmap_reserve(Address::zero(), BYTES_IN_PAGE).unwrap();
            mmap_commit(addr, BYTES_IN_PAGE, Protection::ReadWrite).unwrap();
            unsafe {
                addr.store(42usize);
                assert_eq!(addr.load::<usize>(), 42);
            }
            munmap(addr, BYTES_IN_PAGE).unwrap();
        });
    }

    #[test]
    fn uncommit_then_recommit() {
        serial_test(|| {
            let addr = mmap_reserve(Address::zero(), BYTES_IN_PAGE).unwrap();
            mmap_commit(addr, BYTES_IN_PAGE, Protection::ReadWrite).unwrap();
            unsafe { addr.store(1usize) };
            mmap_uncommit(addr, BYTES_IN_PAGE).unwrap();
            // The second commit must not fail due to residue from the first,
            // and must hand back demand-zero pages.
            mmap_commit(addr, BYTES_IN_PAGE, Protection::ReadWrite).unwrap();
            assert_eq!(unsafe { addr.load::<usize>() }, 0);
            munmap(addr, BYTES_IN_PAGE).unwrap();
        });
    }

    #[test]
    fn recoverable_classification() {
        let inval = Error::from_raw_os_error(libc::EINVAL);
        let nomem = Error::from_raw_os_error(libc::ENOMEM);
        assert!(is_recoverable_mmap_error(&inval));
        assert!(!is_recoverable_mmap_error(&nomem));
        assert!(is_mmap_oom(&nomem));
    }
}
