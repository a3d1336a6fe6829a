//! Regions that span one or more whole commit units.

use super::MapperCore;
use crate::error::{MapperError, Result};
use crate::pretouch::WorkerPool;
use crate::storage::PageStorage;

/// Every region owns `pages_per_region` consecutive pages, so a region range
/// maps to one contiguous page range.
pub(crate) struct LargeRegionStrategy {
    pages_per_region: usize,
}

impl LargeRegionStrategy {
    pub(crate) fn new(region_granularity: usize, commit_granularity: usize) -> Result<Self> {
        if region_granularity < commit_granularity || region_granularity % commit_granularity != 0 {
            return Err(MapperError::GranularityMismatch {
                region_granularity,
                commit_granularity,
            });
        }
        Ok(Self {
            pages_per_region: region_granularity / commit_granularity,
        })
    }

    pub(crate) fn pages_per_region(&self) -> usize {
        self.pages_per_region
    }

    /// Returns the zero-filled flag of the single storage commit
    pub(crate) fn commit_regions<S: PageStorage>(
        &self,
        core: &mut MapperCore<S>,
        start: usize,
        count: usize,
        pool: Option<&WorkerPool>,
    ) -> Result<bool> {
        let start_page = start * self.pages_per_region;
        let size_in_pages = count * self.pages_per_region;
        core.check_page_range(start_page, size_in_pages)?;

        let zero_filled = core.storage.commit(start_page, size_in_pages)?;
        core.stats.pages_committed += size_in_pages as u64;

        // Placement is per region even though the commit is batched.
        let region_bytes = core.storage.page_size() * self.pages_per_region;
        for region in start..start + count {
            let address = core.storage.page_start(region * self.pages_per_region);
            core.request_placement(address, region_bytes, region);
        }

        // Bits follow storage even if the pretouch below fails.
        core.commit_map.set_range(start, start + count);
        core.pretouch(start_page, size_in_pages, pool)?;
        Ok(zero_filled)
    }

    pub(crate) fn uncommit_regions<S: PageStorage>(
        &self,
        core: &mut MapperCore<S>,
        start: usize,
        count: usize,
    ) -> Result<()> {
        let start_page = start * self.pages_per_region;
        let size_in_pages = count * self.pages_per_region;
        core.check_page_range(start_page, size_in_pages)?;

        core.storage.uncommit(start_page, size_in_pages)?;
        core.stats.pages_uncommitted += size_in_pages as u64;
        core.commit_map.clear_range(start, start + count);
        Ok(())
    }

    /// A region is committed iff every one of its pages is
    pub(crate) fn verify<S: PageStorage>(&self, core: &MapperCore<S>) -> Result<()> {
        let committable = core.storage.committable_pages();
        for region in 0..core.commit_map.len() {
            let first = region * self.pages_per_region;
            let last = first + self.pages_per_region;
            if first >= committable {
                if core.commit_map.at(region) {
                    return Err(MapperError::InvariantViolated(format!(
                        "region {} committed beyond the committable pages",
                        region
                    )));
                }
                continue;
            }

            let expected = core.commit_map.at(region);
            if let Some(page) =
                (first..last.min(committable)).find(|&page| core.storage.is_committed(page) != expected)
            {
                return Err(MapperError::InvariantViolated(format!(
                    "region {} is {} but page {} is {}",
                    region,
                    state(expected),
                    page,
                    state(!expected)
                )));
            }
        }
        Ok(())
    }
}

fn state(committed: bool) -> &'static str {
    if committed {
        "committed"
    } else {
        "uncommitted"
    }
}
