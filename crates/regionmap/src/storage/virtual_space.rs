//! Page-Based Virtual Space
//!
//! Page-granular view of a `ReservedSpace`. Tracks which pages are committed
//! and whether a page may still hold contents from an earlier commit.
//!
//! ```text
//! base                                                   base + reserved
//! │ page 0 │ page 1 │ page 2 │ ... │ page U-1 │ ... │ page T-1 │
//! └──────────── committable (used size) ──────┘
//! ```
//!
//! Uncommitted pages are handed back with `MADV_DONTNEED`, which makes the
//! next access read zeros for private anonymous memory. Where that is not
//! available (non-unix, or pages smaller than the OS page) the page is marked
//! dirty and the next commit reports it as not zero-filled.

use crate::bitmap::CommitBitmap;
use crate::error::{MapperError, Result};
use crate::pretouch::{PretouchTask, WorkerPool, MIN_PAGE_SIZE};
use crate::storage::{PageStorage, ReservedSpace};
use crate::util::{is_aligned, is_power_of_two, os_page_size};
use crate::util::constants::MB;

/// PageBasedVirtualSpace - commit/uncommit of whole pages
pub struct PageBasedVirtualSpace {
    /// Reservation owned by this space
    rs: ReservedSpace,

    /// Page size
    page_size: usize,

    /// Bytes of the reservation that may be committed
    used_size: usize,

    /// Pages covering `used_size`
    committable_pages: usize,

    /// Committed pages
    committed: CommitBitmap,

    /// Pages whose contents may have survived an uncommit
    dirty: CommitBitmap,

    /// Number of committed pages
    committed_pages: usize,

    /// Whether uncommit discards page contents
    discards_on_uncommit: bool,

    /// Bytes per pretouch work unit
    pretouch_chunk_size: usize,
}

impl PageBasedVirtualSpace {
    /// Create a page view of `rs` where the first `used_size` bytes may be
    /// committed
    ///
    /// # Errors
    /// - `NotPowerOfTwo` if `page_size` is not a power of two
    /// - `Configuration` if `page_size` is below `MIN_PAGE_SIZE`
    /// - `Configuration` if `used_size` exceeds the reservation or the
    ///   reservation base is not page aligned
    pub fn new(rs: ReservedSpace, used_size: usize, page_size: usize) -> Result<Self> {
        if !is_power_of_two(page_size) {
            return Err(MapperError::NotPowerOfTwo {
                what: "page_size",
                value: page_size,
            });
        }
        if page_size < MIN_PAGE_SIZE {
            return Err(MapperError::Configuration(format!(
                "page size {} below the minimum of {} bytes",
                page_size, MIN_PAGE_SIZE
            )));
        }
        if used_size > rs.size() {
            return Err(MapperError::Configuration(format!(
                "used size {} exceeds reserved size {}",
                used_size,
                rs.size()
            )));
        }
        if !is_aligned(rs.base(), page_size) {
            return Err(MapperError::Configuration(format!(
                "reservation base {:#x} not aligned to page size {}",
                rs.base(),
                page_size
            )));
        }
        debug_assert!(
            rs.mapping().as_ptr() as usize + rs.mapping().len() >= rs.base() + rs.size(),
            "reservation extends past its mapping"
        );

        let total_pages = rs.size().div_ceil(page_size);
        let committable_pages = used_size.div_ceil(page_size);
        let discards_on_uncommit = cfg!(unix) && page_size >= os_page_size();

        Ok(Self {
            rs,
            page_size,
            used_size,
            committable_pages,
            committed: CommitBitmap::new(total_pages),
            dirty: CommitBitmap::new(total_pages),
            committed_pages: 0,
            discards_on_uncommit,
            pretouch_chunk_size: MB,
        })
    }

    /// Set bytes per pretouch work unit
    pub fn set_pretouch_chunk_size(&mut self, chunk_size: usize) {
        self.pretouch_chunk_size = chunk_size.max(1);
    }

    /// Bytes that may be committed
    pub fn used_size(&self) -> usize {
        self.used_size
    }

    /// Number of committed pages
    pub fn committed_pages(&self) -> usize {
        self.committed_pages
    }

    /// Committed bytes
    pub fn committed_size(&self) -> usize {
        self.committed_pages * self.page_size
    }

    /// True if every page in the range is committed
    pub fn is_area_committed(&self, start_page: usize, pages: usize) -> bool {
        match start_page.checked_add(pages) {
            Some(end) if end <= self.committed.len() => self.committed.is_range_set(start_page, end),
            _ => false,
        }
    }

    /// True if every page in the range is uncommitted
    pub fn is_area_uncommitted(&self, start_page: usize, pages: usize) -> bool {
        match start_page.checked_add(pages) {
            Some(end) if end <= self.committed.len() => {
                self.committed.is_range_clear(start_page, end)
            },
            _ => false,
        }
    }

    /// Reservation backing this space
    pub fn reserved_space(&self) -> &ReservedSpace {
        &self.rs
    }

    /// Copy bytes out of committed memory
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_access(offset, buf.len())?;
        // Safety: the range lies inside committed pages of our mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(
                (self.rs.base() + offset) as *const u8,
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Copy bytes into committed memory
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_access(offset, data.len())?;
        // Safety: the range lies inside committed pages of our mapping and
        // `&mut self` excludes other accessors through this space.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (self.rs.base() + offset) as *mut u8,
                data.len(),
            );
        }
        Ok(())
    }

    fn check_access(&self, offset: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let end = offset.checked_add(len).ok_or(MapperError::PageOutOfBounds {
            start: offset / self.page_size,
            count: 0,
            limit: self.committable_pages,
        })?;
        let start_page = offset / self.page_size;
        let end_page = end.div_ceil(self.page_size);
        if !self.is_area_committed(start_page, end_page - start_page) {
            return Err(MapperError::InvariantViolated(format!(
                "access to [{:#x}, {:#x}) touches uncommitted pages",
                offset, end
            )));
        }
        Ok(())
    }

    fn check_range(&self, start_page: usize, pages: usize) -> Result<usize> {
        match start_page.checked_add(pages) {
            Some(end) if end <= self.committable_pages => Ok(end),
            _ => Err(MapperError::PageOutOfBounds {
                start: start_page,
                count: pages,
                limit: self.committable_pages,
            }),
        }
    }

    fn page_range_bytes(&self, start_page: usize, pages: usize) -> (usize, usize) {
        (self.page_start(start_page), pages * self.page_size)
    }
}

impl PageStorage for PageBasedVirtualSpace {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn base(&self) -> usize {
        self.rs.base()
    }

    fn reserved_size(&self) -> usize {
        self.rs.size()
    }

    fn committable_pages(&self) -> usize {
        self.committable_pages
    }

    fn commit(&mut self, start_page: usize, pages: usize) -> Result<bool> {
        if pages == 0 {
            return Ok(true);
        }
        let end = self.check_range(start_page, pages)?;
        if let Some(page) = self.committed.first_set_in(start_page, end) {
            return Err(MapperError::InvariantViolated(format!(
                "page {} is already committed",
                page
            )));
        }

        let (addr, len) = self.page_range_bytes(start_page, pages);
        os::commit(addr, len, self.discards_on_uncommit);

        let zero_filled = self.dirty.is_range_clear(start_page, end);
        self.dirty.clear_range(start_page, end);
        self.committed.set_range(start_page, end);
        self.committed_pages += pages;

        log::trace!(
            "committed pages [{}, {}) at {:#x}, zero_filled={}",
            start_page,
            end,
            addr,
            zero_filled
        );
        Ok(zero_filled)
    }

    fn uncommit(&mut self, start_page: usize, pages: usize) -> Result<()> {
        if pages == 0 {
            return Ok(());
        }
        let end = self.check_range(start_page, pages)?;
        if let Some(page) = self.committed.first_clear_in(start_page, end) {
            return Err(MapperError::InvariantViolated(format!(
                "page {} is not committed",
                page
            )));
        }

        let (addr, len) = self.page_range_bytes(start_page, pages);
        if self.discards_on_uncommit {
            os::discard(addr, len)?;
        } else {
            self.dirty.set_range(start_page, end);
        }

        self.committed.clear_range(start_page, end);
        self.committed_pages -= pages;

        log::trace!("uncommitted pages [{}, {}) at {:#x}", start_page, end, addr);
        Ok(())
    }

    fn pretouch(&self, start_page: usize, pages: usize, pool: Option<&WorkerPool>) -> Result<()> {
        if pages == 0 {
            return Ok(());
        }
        let end = self.check_range(start_page, pages)?;
        if !self.committed.is_range_set(start_page, end) {
            return Err(MapperError::InvariantViolated(format!(
                "pretouch of pages [{}, {}) that are not all committed",
                start_page, end
            )));
        }

        let task = PretouchTask::new(
            self.page_start(start_page),
            self.page_start(end),
            self.page_size,
            self.pretouch_chunk_size,
        )?;
        match pool {
            Some(pool) => pool.run_task(&task)?,
            None => task.work(0),
        }
        Ok(())
    }

    fn is_committed(&self, page: usize) -> bool {
        page < self.committed.len() && self.committed.at(page)
    }
}

#[cfg(unix)]
mod os {
    use crate::error::{MapperError, Result};

    /// Hint the kernel that the range is about to be used
    pub fn commit(addr: usize, len: usize, page_aligned: bool) {
        if !page_aligned {
            return;
        }
        // Safety: the range lies inside our own anonymous mapping.
        let rc = unsafe { libc::madvise(addr as *mut libc::c_void, len, libc::MADV_WILLNEED) };
        if rc != 0 {
            log::debug!(
                "MADV_WILLNEED on [{:#x}, {:#x}) ignored: {}",
                addr,
                addr + len,
                std::io::Error::last_os_error()
            );
        }
    }

    /// Release physical pages; the next access reads zeros
    pub fn discard(addr: usize, len: usize) -> Result<()> {
        // Safety: the range lies inside our own private anonymous mapping and
        // no references into it survive an uncommit.
        let rc = unsafe { libc::madvise(addr as *mut libc::c_void, len, libc::MADV_DONTNEED) };
        if rc != 0 {
            return Err(MapperError::VirtualMemoryError(format!(
                "MADV_DONTNEED on [{:#x}, {:#x}) failed: {}",
                addr,
                addr + len,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

#[cfg(not(unix))]
mod os {
    use crate::error::Result;

    pub fn commit(_addr: usize, _len: usize, _page_aligned: bool) {}

    pub fn discard(_addr: usize, _len: usize) -> Result<()> {
        Ok(())
    }
}
