use crate::util::memory;

/// The page sizes the platform supports, queried once at startup.
///
/// The table drives large-page selection: for a requested alignment the
/// manager picks the largest supported size that evenly divides it, and falls
/// back to the base page otherwise.
pub struct PageSizeTable {
    base: usize,
    /// Supported sizes larger than the base page, descending.
    large: Vec<usize>,
}

impl PageSizeTable {
    pub fn query() -> Self {
        let mut large = platform_large_page_sizes();
        large.sort_unstable_by(|a, b| b.cmp(a));
        PageSizeTable {
            base: memory::vm_page_size(),
            large,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_sizes(base: usize, mut large: Vec<usize>) -> Self {
        large.sort_unstable_by(|a, b| b.cmp(a));
        PageSizeTable { base, large }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn large_sizes(&self) -> &[usize] {
        &self.large
    }

    /// The largest supported page size that evenly divides `alignment`, or the
    /// base page size when no large page fits.
    pub fn page_size_for_alignment(&self, alignment: usize) -> usize {
        debug_assert!(
            crate::util::conversions::raw_is_aligned(alignment, self.base),
            "{} is not aligned to {}",
            alignment,
            self.base
        );
        self.large
            .iter()
            .copied()
            .find(|&size| alignment % size == 0)
            .unwrap_or(self.base)
    }
}

/// Ask the kernel which large page sizes exist. On Linux each supported size
/// has a directory under /sys/kernel/mm/hugepages named `hugepages-<kB>kB`.
#[cfg(target_os = "linux")]
fn platform_large_page_sizes() -> Vec<usize> {
    let mut sizes = Vec::new();
    let Ok(entries) = std::fs::read_dir("/sys/kernel/mm/hugepages") else {
        return sizes;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(kb) = name
            .to_str()
            .and_then(|n| n.strip_prefix("hugepages-"))
            .and_then(|n| n.strip_suffix("kB"))
            .and_then(|n| n.parse::<usize>().ok())
        else {
            continue;
        };
        sizes.push(kb * 1024);
    }
    sizes
}

#[cfg(not(target_os = "linux"))]
fn platform_large_page_sizes() -> Vec<usize> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::{BYTES_IN_GBYTE, BYTES_IN_MBYTE, BYTES_IN_PAGE};

    #[test]
    fn picks_largest_dividing_size() {
        let table = PageSizeTable::with_sizes(
            BYTES_IN_PAGE,
            vec![2 * BYTES_IN_MBYTE, BYTES_IN_GBYTE],
        );
        assert_eq!(table.page_size_for_alignment(BYTES_IN_GBYTE), BYTES_IN_GBYTE);
        assert_eq!(
            table.page_size_for_alignment(2 * BYTES_IN_MBYTE),
            2 * BYTES_IN_MBYTE
        );
        // 4M is a multiple of 2M but not of 1G.
        assert_eq!(
            table.page_size_for_alignment(4 * BYTES_IN_MBYTE),
            2 * BYTES_IN_MBYTE
        );
    }

    #[test]
    fn falls_back_to_base() {
        let table = PageSizeTable::with_sizes(BYTES_IN_PAGE, vec![2 * BYTES_IN_MBYTE]);
        assert_eq!(table.page_size_for_alignment(8 * BYTES_IN_PAGE), BYTES_IN_PAGE);
        let bare = PageSizeTable::with_sizes(BYTES_IN_PAGE, vec![]);
        assert_eq!(bare.page_size_for_alignment(BYTES_IN_GBYTE), BYTES_IN_PAGE);
    }

    #[test]
    fn query_reports_base_page() {
        let table = PageSizeTable::query();
        assert!(table.base().is_power_of_two());
    }
}
