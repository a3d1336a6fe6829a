//! Page Storage - Backing Memory for Mappers
//!
//! A mapper translates region ranges into page ranges and hands them to a
//! `PageStorage`. The storage owns the reserved address range and performs
//! the OS-level commit and uncommit of whole pages.
//!
//! ```text
//! Reserve ──► Commit ──► (Pretouch) ──► Use ──► Uncommit
//!    │          │             │                    │
//!    │          │             │                    └── madvise(MADV_DONTNEED)
//!    │          │             └── one write fault per page, on worker threads
//!    │          └── madvise(MADV_WILLNEED), returns zero-filled flag
//!    └── anonymous mapping, no physical backing yet
//! ```

pub mod reserved;
pub mod virtual_space;

pub use reserved::ReservedSpace;
pub use virtual_space::PageBasedVirtualSpace;

use crate::error::Result;
use crate::pretouch::WorkerPool;

/// Page-granular backing store used by a mapper
///
/// Page indices are relative to `base()`. Implementations must reject
/// commits of committed pages and uncommits of uncommitted pages with
/// `MapperError::InvariantViolated`.
pub trait PageStorage {
    /// Size of one page in bytes
    fn page_size(&self) -> usize;

    /// First address of the reservation
    fn base(&self) -> usize;

    /// Total reserved bytes
    fn reserved_size(&self) -> usize;

    /// Pages that may be committed (covers the used size only)
    fn committable_pages(&self) -> usize;

    /// Commit `[start_page, start_page + pages)`
    ///
    /// Returns true if the pages are guaranteed to read as zero.
    fn commit(&mut self, start_page: usize, pages: usize) -> Result<bool>;

    /// Uncommit `[start_page, start_page + pages)`
    fn uncommit(&mut self, start_page: usize, pages: usize) -> Result<()>;

    /// Fault in `[start_page, start_page + pages)`, in parallel if a pool is
    /// given. Returns only after every page has been touched.
    fn pretouch(&self, start_page: usize, pages: usize, pool: Option<&WorkerPool>) -> Result<()>;

    /// Address of the first byte of a page
    fn page_start(&self, page: usize) -> usize {
        self.base() + page * self.page_size()
    }

    /// True if the page is currently committed
    fn is_committed(&self, page: usize) -> bool;
}
