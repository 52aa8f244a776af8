//! Human-readable rendering of memory baselines.

use std::io;

use itertools::Itertools;

use super::{MemoryBaseline, TrackingLevel};

fn kb(bytes: usize) -> usize {
    bytes / 1024
}

impl MemoryBaseline {
    /// Render the baseline at its own level of detail.
    pub fn render(&self, out: &mut dyn io::Write) -> io::Result<()> {
        self.render_summary(out)?;
        if self.level == TrackingLevel::Detail {
            self.render_sites(out)?;
        }
        Ok(())
    }

    /// Render only the per-category summary.
    pub fn render_summary(&self, out: &mut dyn io::Write) -> io::Result<()> {
        writeln!(out, "Native Memory Tracking:")?;
        writeln!(out)?;
        writeln!(
            out,
            "Total: reserved={}KB, committed={}KB, malloc={}KB",
            kb(self.total_reserved()),
            kb(self.total_committed()),
            kb(self.total_malloc()),
        )?;
        for (category, snapshot) in self.by_category.iter() {
            if snapshot.reserved == 0 && snapshot.committed == 0 && snapshot.malloc_bytes == 0 {
                continue;
            }
            writeln!(
                out,
                "-{:>22} (reserved={}KB, committed={}KB)",
                category.name(),
                kb(snapshot.reserved),
                kb(snapshot.committed),
            )?;
            if snapshot.malloc_count > 0 {
                writeln!(
                    out,
                    "{:>24} (malloc={}KB #{})",
                    "",
                    kb(snapshot.malloc_bytes),
                    snapshot.malloc_count,
                )?;
            }
        }
        writeln!(out)
    }

    fn render_sites(&self, out: &mut dyn io::Write) -> io::Result<()> {
        writeln!(out, "Details:")?;
        writeln!(out)?;
        let ordered = self
            .sites
            .iter()
            .sorted_by_key(|s| std::cmp::Reverse(s.reserved));
        for site in ordered {
            writeln!(
                out,
                "[{}] {} (reserved={}KB #{})",
                site.category.name(),
                site.site,
                kb(site.reserved),
                site.count,
            )?;
        }
        writeln!(out)
    }
}
