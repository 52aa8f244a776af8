//! NUMA locality groups and placement hints.
//!
//! Placement calls are advisory only. They are valid only on committed,
//! page-aligned, page-size-multiple ranges; a violating call is a contract
//! violation and is checked in debug builds, ignored otherwise.

use crate::util::conversions;
use crate::util::Address;

/// The NUMA topology visible to this process, queried once at startup.
pub struct NumaInterface {
    groups: usize,
}

impl NumaInterface {
    pub fn query() -> Self {
        NumaInterface {
            groups: platform_group_count().max(1),
        }
    }

    /// The number of locality groups. 1 on non-NUMA machines.
    pub fn groups(&self) -> usize {
        self.groups
    }

    /// The locality group of the calling thread. Group ids are dense in
    /// `0..groups()`.
    pub fn current_group_id(&self) -> usize {
        if self.groups <= 1 {
            return 0;
        }
        platform_current_group().min(self.groups - 1)
    }

    fn check_range(&self, addr: Address, bytes: usize) -> bool {
        let ok = conversions::is_page_aligned(addr)
            && conversions::raw_is_aligned(bytes, crate::util::constants::BYTES_IN_PAGE);
        debug_assert!(ok, "NUMA hint on unaligned range {}+{}", addr, bytes);
        ok
    }

    /// Hint that the range will be accessed mostly by the next thread touching
    /// it. No-op where the platform offers no such advice.
    pub fn make_local(&self, addr: Address, bytes: usize, group: usize) {
        if !self.check_range(addr, bytes) {
            return;
        }
        trace!("numa: make_local {}+{} group {}", addr, bytes, group);
        platform_advise_local(addr, bytes);
    }

    /// Hint that the range will be accessed from many threads across groups.
    pub fn make_global(&self, addr: Address, bytes: usize) {
        if !self.check_range(addr, bytes) {
            return;
        }
        trace!("numa: make_global {}+{}", addr, bytes);
        platform_advise_global(addr, bytes);
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn platform_group_count() -> usize {
            // Each memory-bearing node appears as /sys/devices/system/node/nodeN.
            let Ok(entries) = std::fs::read_dir("/sys/devices/system/node") else {
                return 1;
            };
            let nodes = entries
                .flatten()
                .filter(|e| {
                    e.file_name()
                        .to_str()
                        .map(|n| n.starts_with("node") && n[4..].chars().all(|c| c.is_ascii_digit()))
                        .unwrap_or(false)
                })
                .count();
            nodes.max(1)
        }

        fn platform_current_group() -> usize {
            let mut cpu: libc::c_uint = 0;
            let mut node: libc::c_uint = 0;
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_getcpu,
                    &mut cpu as *mut libc::c_uint,
                    &mut node as *mut libc::c_uint,
                    std::ptr::null_mut::<libc::c_void>(),
                )
            };
            if ret == 0 {
                node as usize
            } else {
                0
            }
        }

        fn platform_advise_local(_addr: Address, _bytes: usize) {
            // First-touch policy already places pages locally on Linux.
        }

        fn platform_advise_global(addr: Address, bytes: usize) {
            // Spreading hot VM structures across nodes needs an mbind with an
            // interleave policy; madvise has no access-pattern advice for it.
            // WILLNEED at least faults the range in under the current policy.
            unsafe {
                libc::madvise(addr.to_mut_ptr(), bytes, libc::MADV_WILLNEED);
            }
        }
    } else {
        fn platform_group_count() -> usize {
            1
        }

        fn platform_current_group() -> usize {
            0
        }

        fn platform_advise_local(_addr: Address, _bytes: usize) {}

        fn platform_advise_global(_addr: Address, _bytes: usize) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_least_one_group() {
        let numa = NumaInterface::query();
        assert!(numa.groups() >= 1);
        assert!(numa.current_group_id() < numa.groups());
    }
}
