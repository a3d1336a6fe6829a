//! # regionmap - Region-to-Space Mapping for Region-Based Heaps
//!
//! A region-based heap reserves one large virtual address range up front and
//! backs it with physical memory region by region as it grows. `regionmap`
//! owns that translation: given a run of regions to commit or uncommit, it
//! decides exactly which OS pages change state, tracks which regions are
//! backed, and reference-counts pages shared by several small regions.
//!
//! ## Quick Start
//!
//! ```rust
//! use regionmap::storage::ReservedSpace;
//! use regionmap::{MapperConfig, MemoryType, RegionToSpaceMapper};
//!
//! fn main() -> Result<(), regionmap::MapperError> {
//!     let page_size = regionmap::util::os_page_size();
//!     let region_size = 4 * page_size;
//!
//!     let rs = ReservedSpace::reserve(64 * region_size, region_size)?;
//!     let size = rs.size();
//!     let mut heap = RegionToSpaceMapper::create_mapper(
//!         rs,
//!         size,
//!         page_size,
//!         region_size,
//!         1,
//!         MemoryType::Heap,
//!         &MapperConfig::default(),
//!     )?;
//!
//!     // Grow the heap by 8 regions, then give 4 back
//!     heap.commit_regions(0, 8, None)?;
//!     heap.uncommit_regions(4, 4)?;
//!     assert_eq!(heap.num_committed(), 4);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │          Heap coordinator (caller)           │
//! │   commit_regions / uncommit_regions (1 writer)│
//! └──────────────────────┬───────────────────────┘
//!                        │
//! ┌──────────────────────▼───────────────────────┐
//! │             RegionToSpaceMapper              │
//! │  commit map (1 bit / region), listener       │
//! │  ┌──────────────────┐ ┌────────────────────┐ │
//! │  │ large-region     │ │ small-region       │ │
//! │  │ region ⊇ pages   │ │ page ⊇ regions     │ │
//! │  │                  │ │ + page refcounts   │ │
//! │  └────────┬─────────┘ └─────────┬──────────┘ │
//! └───────────┼─────────────────────┼────────────┘
//!             │                     │
//!   ┌─────────▼─────────┐  ┌────────▼────────┐  ┌──────────────┐
//!   │ PageStorage       │  │ NumaPlacement   │  │ WorkerPool   │
//!   │ commit / uncommit │  │ advisory only   │  │ pretouch     │
//!   └───────────────────┘  └─────────────────┘  └──────────────┘
//! ```
//!
//! ## Strategy Selection
//!
//! | Condition | Strategy | Unit |
//! |-----------|----------|------|
//! | `region_granularity >= page_size * commit_factor` | large-region | `pages_per_region` pages per region |
//! | otherwise | small-region | `regions_per_page` regions per page |
//!
//! ## Thread Safety
//!
//! - Mutating calls take `&mut self`; share a mapper with `parking_lot::Mutex`
//! - Pretouch runs on scoped worker threads joined before `commit_regions`
//!   returns
//! - The listener runs on the committing thread after the commit map is
//!   updated

// Mapper
pub mod config;
pub mod error;
pub mod mapper;

// Bookkeeping
pub mod bitmap;
pub mod memtrack;
pub mod refcount;

// Collaborators
pub mod numa;
pub mod pretouch;
pub mod storage;

// Monitoring
pub mod logging;
pub mod stats;

// Utilities
pub mod util;

pub use config::{ConfigError, MapperConfig};
pub use error::{MapperError, Result};
pub use mapper::{CommitListener, MapperKind, MemoryType, RegionToSpaceMapper};
pub use numa::{NoNuma, NumaManager, NumaPlacement};
pub use pretouch::WorkerPool;
pub use stats::MapperStats;
pub use storage::{PageBasedVirtualSpace, PageStorage, ReservedSpace};

/// Crate version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
