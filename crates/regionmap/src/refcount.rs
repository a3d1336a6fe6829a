//! Page reference counts for mappers where several regions share a page.
//!
//! One counter per storage page, sized to the whole reservation up front and
//! indexed directly by page number. A page is committed iff its counter is
//! nonzero.

use crate::error::{MapperError, Result};

/// CommitRefcountArray - number of committed regions per page
#[derive(Debug, Clone)]
pub struct CommitRefcountArray {
    counts: Vec<u32>,
}

impl CommitRefcountArray {
    /// Create a table of `page_count` zeroed counters
    pub fn new(page_count: usize) -> Self {
        Self {
            counts: vec![0; page_count],
        }
    }

    /// Number of pages covered
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// True if no pages are covered
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Current count for a page
    pub fn get(&self, page: usize) -> Option<u32> {
        self.counts.get(page).copied()
    }

    /// Add one dependent region, returning the count before the increment
    pub fn increment(&mut self, page: usize) -> Result<u32> {
        let limit = self.counts.len();
        let count = self.counts.get_mut(page).ok_or(MapperError::PageOutOfBounds {
            start: page,
            count: 1,
            limit,
        })?;
        let old = *count;
        *count = old.checked_add(1).ok_or_else(|| {
            MapperError::Internal(format!("refcount overflow on page {}", page))
        })?;
        Ok(old)
    }

    /// Drop one dependent region, returning the count after the decrement
    ///
    /// Decrementing a zero counter is a protocol violation and leaves the
    /// table unchanged.
    pub fn decrement(&mut self, page: usize) -> Result<u32> {
        let limit = self.counts.len();
        let count = self.counts.get_mut(page).ok_or(MapperError::PageOutOfBounds {
            start: page,
            count: 1,
            limit,
        })?;
        if *count == 0 {
            return Err(MapperError::InvariantViolated(format!(
                "refcount underflow on page {}",
                page
            )));
        }
        *count -= 1;
        Ok(*count)
    }

    /// Number of pages with a nonzero count
    pub fn referenced_pages(&self) -> usize {
        self.counts.iter().filter(|&&c| c != 0).count()
    }
}
