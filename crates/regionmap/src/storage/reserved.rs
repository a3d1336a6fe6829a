//! Reserved address space backed by an anonymous mapping.

use crate::error::{MapperError, Result};
use crate::util::{align_up, is_power_of_two, os_page_size};
use memmap2::{MmapMut, MmapOptions};

/// ReservedSpace - contiguous address range reserved for one heap structure
///
/// The mapping is private and anonymous, so the OS only backs pages with
/// physical memory once they are touched. The range is unmapped on drop.
pub struct ReservedSpace {
    /// Inner mmap handle
    mmap: MmapMut,

    /// Aligned base address inside the mapping
    base: usize,

    /// Usable size from `base`
    size: usize,

    /// Base and size alignment
    alignment: usize,
}

impl ReservedSpace {
    /// Reserve `size` bytes aligned to `alignment`
    ///
    /// `size` is rounded up to `alignment`. If `alignment` exceeds the OS
    /// page size the mapping is over-reserved so an aligned base fits.
    ///
    /// # Examples
    /// ```
    /// use regionmap::storage::ReservedSpace;
    ///
    /// let rs = ReservedSpace::reserve(64 * 1024 * 1024, 4096)?;
    /// assert_eq!(rs.base() % 4096, 0);
    /// assert_eq!(rs.size(), 64 * 1024 * 1024);
    /// # Ok::<(), regionmap::MapperError>(())
    /// ```
    pub fn reserve(size: usize, alignment: usize) -> Result<Self> {
        if !is_power_of_two(alignment) {
            return Err(MapperError::NotPowerOfTwo {
                what: "reservation alignment",
                value: alignment,
            });
        }
        if size == 0 {
            return Err(MapperError::VirtualMemoryError(
                "cannot reserve an empty range".to_string(),
            ));
        }

        let alignment = alignment.max(os_page_size());
        let size = align_up(size, alignment);
        let slack = alignment - os_page_size();
        let map_len = size.checked_add(slack).ok_or_else(|| {
            MapperError::VirtualMemoryError(format!("reservation of {} bytes overflows", size))
        })?;

        let mmap = MmapOptions::new().len(map_len).map_anon().map_err(|e| {
            MapperError::VirtualMemoryError(format!(
                "Failed to reserve {} bytes: {}",
                map_len, e
            ))
        })?;

        let base = align_up(mmap.as_ptr() as usize, alignment);

        log::debug!(
            "reserved [{:#x}, {:#x}) aligned to {}",
            base,
            base + size,
            alignment
        );

        Ok(Self {
            mmap,
            base,
            size,
            alignment,
        })
    }

    /// Base address
    pub fn base(&self) -> usize {
        self.base
    }

    /// Reserved size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Alignment of base and size
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Check if address is in the reserved range
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    /// Underlying mapping
    pub(crate) fn mapping(&self) -> &MmapMut {
        &self.mmap
    }
}

impl std::fmt::Debug for ReservedSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservedSpace")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &self.size)
            .field("alignment", &self.alignment)
            .finish()
    }
}
