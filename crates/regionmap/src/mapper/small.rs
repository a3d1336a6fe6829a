//! Regions smaller than one commit unit.
//!
//! `regions_per_page` consecutive regions share a page. The page stays
//! committed while any of them is, tracked by a per-page refcount.

use super::MapperCore;
use crate::error::{MapperError, Result};
use crate::pretouch::WorkerPool;
use crate::refcount::CommitRefcountArray;
use crate::storage::PageStorage;

pub(crate) struct SmallRegionStrategy {
    regions_per_page: usize,
    refcounts: CommitRefcountArray,
}

impl SmallRegionStrategy {
    pub(crate) fn new(
        region_granularity: usize,
        commit_granularity: usize,
        total_pages: usize,
    ) -> Result<Self> {
        if commit_granularity < region_granularity || commit_granularity % region_granularity != 0 {
            return Err(MapperError::GranularityMismatch {
                region_granularity,
                commit_granularity,
            });
        }
        Ok(Self {
            regions_per_page: commit_granularity / region_granularity,
            refcounts: CommitRefcountArray::new(total_pages),
        })
    }

    pub(crate) fn regions_per_page(&self) -> usize {
        self.regions_per_page
    }

    pub(crate) fn refcount(&self, page: usize) -> Option<u32> {
        self.refcounts.get(page)
    }

    fn page_index(&self, region: usize) -> usize {
        region / self.regions_per_page
    }

    /// Pages touched by `[start, start + count)`, or None for an empty range
    fn page_span(&self, start: usize, count: usize) -> Option<(usize, usize)> {
        if count == 0 {
            return None;
        }
        Some((self.page_index(start), self.page_index(start + count - 1) + 1))
    }

    /// Returns the AND of the zero-filled flags of freshly committed pages.
    /// Pages already committed for a neighbouring region do not contribute.
    pub(crate) fn commit_regions<S: PageStorage>(
        &mut self,
        core: &mut MapperCore<S>,
        start: usize,
        count: usize,
        pool: Option<&WorkerPool>,
    ) -> Result<bool> {
        if let Some((first, last)) = self.page_span(start, count) {
            core.check_page_range(first, last - first)?;
        }

        let mut first_committed: Option<usize> = None;
        let mut num_committed = 0;
        let mut all_zero_filled = true;
        let page_size = core.storage.page_size();

        for region in start..start + count {
            let page = self.page_index(region);
            let old_refcount = self.refcounts.get(page).ok_or_else(|| {
                MapperError::Internal(format!("page {} outside the refcount table", page))
            })?;

            if old_refcount == 0 {
                all_zero_filled &= core.storage.commit(page, 1)?;
                if first_committed.is_none() {
                    first_committed = Some(page);
                }
                num_committed += 1;
                core.stats.pages_committed += 1;

                let address = core.storage.page_start(page);
                core.request_placement(address, page_size, region);
                log::trace!("region {} committed page {}", region, page);
            }

            self.refcounts.increment(page)?;
            core.commit_map.set_bit(region);
        }

        // Fresh pages of one call are contiguous since regions are visited in
        // increasing order.
        if let Some(first) = first_committed {
            core.pretouch(first, num_committed, pool)?;
        }
        Ok(all_zero_filled)
    }

    pub(crate) fn uncommit_regions<S: PageStorage>(
        &mut self,
        core: &mut MapperCore<S>,
        start: usize,
        count: usize,
    ) -> Result<()> {
        self.check_refcounts_cover(start, count)?;

        for region in start..start + count {
            let page = self.page_index(region);
            if self.refcounts.get(page) == Some(1) {
                core.storage.uncommit(page, 1)?;
                core.stats.pages_uncommitted += 1;
                log::trace!("region {} released page {}", region, page);
            }
            self.refcounts.decrement(page)?;
            core.commit_map.clear_bit(region);
        }
        Ok(())
    }

    /// Each page must hold at least as many references as regions of the
    /// range that map to it.
    fn check_refcounts_cover(&self, start: usize, count: usize) -> Result<()> {
        let Some((first, last)) = self.page_span(start, count) else {
            return Ok(());
        };
        let end = start + count;
        for page in first..last {
            let page_start_region = (page * self.regions_per_page).max(start);
            let page_end_region = ((page + 1) * self.regions_per_page).min(end);
            let needed = page_end_region - page_start_region;
            let held = self.refcounts.get(page).unwrap_or(0) as usize;
            if held < needed {
                return Err(MapperError::InvariantViolated(format!(
                    "page {} has refcount {} but {} regions release it",
                    page, held, needed
                )));
            }
        }
        Ok(())
    }

    /// A page's refcount equals its committed regions, and the page is
    /// committed iff the refcount is nonzero
    pub(crate) fn verify<S: PageStorage>(&self, core: &MapperCore<S>) -> Result<()> {
        let num_regions = core.commit_map.len();
        for page in 0..self.refcounts.len() {
            let first = page * self.regions_per_page;
            if first >= num_regions {
                break;
            }
            let last = (first + self.regions_per_page).min(num_regions);
            let set = (first..last).filter(|&region| core.commit_map.at(region)).count();
            let refcount = self.refcounts.get(page).unwrap_or(0) as usize;

            if set != refcount {
                return Err(MapperError::InvariantViolated(format!(
                    "page {} has refcount {} but {} committed regions",
                    page, refcount, set
                )));
            }
            if core.storage.is_committed(page) != (refcount > 0) {
                return Err(MapperError::InvariantViolated(format!(
                    "page {} commit state disagrees with refcount {}",
                    page, refcount
                )));
            }
        }
        Ok(())
    }
}
