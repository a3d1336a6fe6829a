//! Region-to-Space Mapper
//!
//! Maps fixed-size heap regions onto the pages of a page storage. Two
//! strategies exist, chosen once from the ratio of region granularity to
//! commit granularity (`page_size * commit_factor`):
//!
//! ```text
//! LargerThanCommitSize (G >= P·F)          SmallerThanCommitSize (G < P·F)
//!
//! regions │  r0   │  r1   │  r2   │        regions │r0│r1│r2│r3│r4│r5│r6│r7│
//!         ├─┬─┬─┬─┼─┬─┬─┬─┼─┬─┬─┬─┤                ├───────────┼───────────┤
//! pages   │0│1│2│3│4│5│6│7│8│9│…│ │        pages   │  page 0   │  page 1   │
//!                                                  refcount: number of
//! each region owns whole pages                     committed regions on it
//! ```
//!
//! The mapper does no internal locking. One writer at a time must call
//! `commit_regions` and `uncommit_regions`; wrap the mapper in a
//! `parking_lot::Mutex` to share it.

mod large;
mod small;

use crate::bitmap::CommitBitmap;
use crate::config::MapperConfig;
use crate::error::{MapperError, Result};
use crate::logging::{self, MapperEvent};
use crate::memtrack;
use crate::numa::{self, NoNuma, NumaPlacement};
use crate::pretouch::WorkerPool;
use crate::stats::MapperStats;
use crate::storage::{PageBasedVirtualSpace, PageStorage, ReservedSpace};
use crate::util::is_power_of_two;
use std::sync::Arc;

use large::LargeRegionStrategy;
use small::SmallRegionStrategy;

/// Memory use classification of a mapped space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    /// Backs the heap itself; receives NUMA placement advisories
    Heap,
    /// GC side tables (card table, mark bitmaps, offset tables)
    GcAuxiliary,
    /// Anything else
    Other,
}

impl MemoryType {
    /// True for heap-backing memory
    pub fn is_heap(self) -> bool {
        matches!(self, MemoryType::Heap)
    }
}

/// Receives notification of newly committed regions
///
/// Called once per successful `commit_regions`, on the committing thread,
/// after the commit map reflects the whole range.
pub trait CommitListener: Send + Sync {
    /// `zero_filled` is true if the freshly committed memory reads as zero
    fn on_commit(&self, start_index: usize, num_regions: usize, zero_filled: bool);
}

/// Strategy selected at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapperKind {
    /// Every region spans one or more whole pages
    LargerThanCommitSize { pages_per_region: usize },
    /// Several regions share one page
    SmallerThanCommitSize { regions_per_page: usize },
}

impl MapperKind {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            MapperKind::LargerThanCommitSize { .. } => "large-region",
            MapperKind::SmallerThanCommitSize { .. } => "small-region",
        }
    }
}

enum Strategy {
    Large(LargeRegionStrategy),
    Small(SmallRegionStrategy),
}

/// State shared by both strategies
pub(crate) struct MapperCore<S: PageStorage> {
    pub(crate) storage: S,
    pub(crate) commit_map: CommitBitmap,
    pub(crate) memory_type: MemoryType,
    pub(crate) numa: Arc<dyn NumaPlacement>,
    pub(crate) always_pretouch: bool,
    pub(crate) pretouch_pool: Option<WorkerPool>,
    pub(crate) verbose: bool,
    pub(crate) stats: MapperStats,
}

impl<S: PageStorage> MapperCore<S> {
    /// Issue a placement advisory for heap memory
    pub(crate) fn request_placement(&mut self, address: usize, size: usize, region: usize) {
        if !self.memory_type.is_heap() {
            return;
        }
        self.numa.request_memory_on_node(address, size, region);
        self.stats.numa_advisories += 1;
        if self.verbose {
            logging::log_event(MapperEvent::NumaAdvice {
                region,
                address,
                size,
            });
        }
    }

    /// Fault in freshly committed pages if eager touch is enabled
    pub(crate) fn pretouch(
        &mut self,
        start_page: usize,
        pages: usize,
        pool: Option<&WorkerPool>,
    ) -> Result<()> {
        if !self.always_pretouch || pages == 0 {
            return Ok(());
        }
        let pool = pool.or(self.pretouch_pool.as_ref());
        self.storage.pretouch(start_page, pages, pool)?;
        self.stats.pages_pretouched += pages as u64;
        if self.verbose {
            logging::log_event(MapperEvent::Pretouch {
                start_page,
                pages,
                workers: pool.map_or(1, WorkerPool::active_workers),
            });
        }
        Ok(())
    }

    fn check_page_range(&self, start_page: usize, pages: usize) -> Result<()> {
        let limit = self.storage.committable_pages();
        match start_page.checked_add(pages) {
            Some(end) if end <= limit => Ok(()),
            _ => Err(MapperError::PageOutOfBounds {
                start: start_page,
                count: pages,
                limit,
            }),
        }
    }
}

/// RegionToSpaceMapper - commits and uncommits heap regions
///
/// # Examples
///
/// ```rust
/// use regionmap::storage::ReservedSpace;
/// use regionmap::{MapperConfig, MemoryType, RegionToSpaceMapper};
///
/// let page_size = regionmap::util::os_page_size();
/// let region_size = 4 * page_size;
/// let rs = ReservedSpace::reserve(16 * region_size, page_size)?;
/// let size = rs.size();
///
/// let mut mapper = RegionToSpaceMapper::create_mapper(
///     rs,
///     size,
///     page_size,
///     region_size,
///     1,
///     MemoryType::Heap,
///     &MapperConfig::default(),
/// )?;
///
/// mapper.commit_regions(0, 2, None)?;
/// assert!(mapper.is_committed(1));
/// mapper.uncommit_regions(0, 2)?;
/// assert_eq!(mapper.num_committed(), 0);
/// # Ok::<(), regionmap::MapperError>(())
/// ```
pub struct RegionToSpaceMapper<S: PageStorage = PageBasedVirtualSpace> {
    core: MapperCore<S>,
    strategy: Strategy,
    region_granularity: usize,
    listener: Option<Arc<dyn CommitListener>>,
}

impl RegionToSpaceMapper<PageBasedVirtualSpace> {
    /// Create a mapper over a reservation, choosing the strategy from the
    /// granularities
    ///
    /// `used_size` bytes of `rs` may be committed. Each region corresponds
    /// to `region_granularity / commit_factor` bytes of this space.
    pub fn create_mapper(
        rs: ReservedSpace,
        used_size: usize,
        page_size: usize,
        region_granularity: usize,
        commit_factor: usize,
        memory_type: MemoryType,
        config: &MapperConfig,
    ) -> Result<Self> {
        config.validate()?;
        let mut storage = PageBasedVirtualSpace::new(rs, used_size, page_size)?;
        storage.set_pretouch_chunk_size(config.pretouch_chunk_size);
        Self::with_storage(storage, region_granularity, commit_factor, memory_type, config)
    }
}

impl<S: PageStorage> RegionToSpaceMapper<S> {
    /// Create a mapper over any page storage
    ///
    /// # Errors
    /// - `NotPowerOfTwo` if the page size or region granularity is not a
    ///   power of two
    /// - `Configuration` if `commit_factor` is zero or the config is invalid
    /// - `GranularityMismatch` if one granularity does not divide the other
    pub fn with_storage(
        storage: S,
        region_granularity: usize,
        commit_factor: usize,
        memory_type: MemoryType,
        config: &MapperConfig,
    ) -> Result<Self> {
        config.validate()?;

        let page_size = storage.page_size();
        if !is_power_of_two(page_size) {
            return Err(MapperError::NotPowerOfTwo {
                what: "page_size",
                value: page_size,
            });
        }
        if !is_power_of_two(region_granularity) {
            return Err(MapperError::NotPowerOfTwo {
                what: "region_granularity",
                value: region_granularity,
            });
        }
        if commit_factor == 0 {
            return Err(MapperError::Configuration(
                "commit_factor must be > 0".to_string(),
            ));
        }

        let commit_granularity = page_size.checked_mul(commit_factor).ok_or_else(|| {
            MapperError::Configuration(format!(
                "commit granularity {} * {} overflows",
                page_size, commit_factor
            ))
        })?;
        let num_regions = storage
            .reserved_size()
            .checked_mul(commit_factor)
            .map(|bytes| bytes / region_granularity)
            .ok_or_else(|| {
                MapperError::Configuration(format!(
                    "region count for {} bytes with commit factor {} overflows",
                    storage.reserved_size(),
                    commit_factor
                ))
            })?;

        let strategy = if region_granularity >= commit_granularity {
            Strategy::Large(LargeRegionStrategy::new(region_granularity, commit_granularity)?)
        } else {
            let total_pages = storage.reserved_size().div_ceil(page_size);
            Strategy::Small(SmallRegionStrategy::new(
                region_granularity,
                commit_granularity,
                total_pages,
            )?)
        };

        let numa: Arc<dyn NumaPlacement> = if config.numa_aware {
            let manager = numa::global();
            if memory_type.is_heap() {
                manager.set_region_info(region_granularity, commit_granularity);
            }
            manager
        } else {
            Arc::new(NoNuma)
        };

        let pretouch_pool = if config.always_pretouch {
            Some(match config.pretouch_workers {
                Some(workers) => WorkerPool::new(workers)?,
                None => WorkerPool::with_default_workers(),
            })
        } else {
            None
        };

        memtrack::record_virtual_memory_type(storage.base(), storage.reserved_size(), memory_type);

        let mapper = Self {
            core: MapperCore {
                storage,
                commit_map: CommitBitmap::new(num_regions),
                memory_type,
                numa,
                always_pretouch: config.always_pretouch,
                pretouch_pool,
                verbose: config.verbose,
                stats: MapperStats::default(),
            },
            strategy,
            region_granularity,
            listener: None,
        };

        log::debug!(
            "created {} mapper at {:#x}: {} regions, {:?}, {:?}",
            mapper.kind().name(),
            mapper.core.storage.base(),
            num_regions,
            mapper.kind(),
            memory_type
        );
        if config.verbose {
            logging::log_event(MapperEvent::MapperCreated {
                strategy: mapper.kind().name().to_string(),
                base: mapper.core.storage.base(),
                num_regions,
                region_granularity,
                commit_granularity,
            });
        }

        Ok(mapper)
    }

    /// Replace the NUMA placement collaborator
    pub fn with_numa(mut self, numa: Arc<dyn NumaPlacement>) -> Self {
        self.core.numa = numa;
        self
    }

    /// Register the commit listener
    ///
    /// # Errors
    /// - `ListenerAlreadySet` if a listener is already registered
    pub fn set_mapping_changed_listener(&mut self, listener: Arc<dyn CommitListener>) -> Result<()> {
        if self.listener.is_some() {
            return Err(MapperError::ListenerAlreadySet);
        }
        self.listener = Some(listener);
        Ok(())
    }

    /// Commit regions `[start, start + count)`
    ///
    /// Every region in the range must be uncommitted. `pool` is used for
    /// pretouch when `always_pretouch` is configured; without it the
    /// mapper's own pool is used. The listener fires once, also for an
    /// empty range.
    ///
    /// # Errors
    /// - `RegionOutOfBounds` / `PageOutOfBounds` for ranges outside the space
    /// - `InvariantViolated` if a region is already committed
    /// - `VirtualMemoryError` if the storage failed (fatal)
    pub fn commit_regions(&mut self, start: usize, count: usize, pool: Option<&WorkerPool>) -> Result<()> {
        let end = self.check_region_range(start, count)?;
        if let Some(region) = self.core.commit_map.first_set_in(start, end) {
            return Err(MapperError::InvariantViolated(format!(
                "Trying to commit storage at region {} that is already committed",
                region
            )));
        }

        let pages_before = self.core.stats.pages_committed;
        let zero_filled = match &mut self.strategy {
            Strategy::Large(strategy) => strategy.commit_regions(&mut self.core, start, count, pool)?,
            Strategy::Small(strategy) => strategy.commit_regions(&mut self.core, start, count, pool)?,
        };
        let pages = (self.core.stats.pages_committed - pages_before) as usize;

        self.core.stats.commit_calls += 1;
        self.core.stats.regions_committed += count as u64;

        log::debug!(
            "committed regions [{}, {}) ({} pages, zero_filled={})",
            start,
            end,
            pages,
            zero_filled
        );
        if self.core.verbose {
            logging::log_event(MapperEvent::Commit {
                start,
                count,
                pages,
                zero_filled,
            });
        }

        self.fire_on_commit(start, count, zero_filled);
        Ok(())
    }

    /// Uncommit regions `[start, start + count)`
    ///
    /// Every region in the range must be committed.
    ///
    /// # Errors
    /// - `RegionOutOfBounds` for ranges outside the space
    /// - `InvariantViolated` if a region is not committed
    /// - `VirtualMemoryError` if the storage failed (fatal)
    pub fn uncommit_regions(&mut self, start: usize, count: usize) -> Result<()> {
        let end = self.check_region_range(start, count)?;
        if let Some(region) = self.core.commit_map.first_clear_in(start, end) {
            return Err(MapperError::InvariantViolated(format!(
                "Trying to uncommit storage at region {} that is not committed",
                region
            )));
        }

        let pages_before = self.core.stats.pages_uncommitted;
        match &mut self.strategy {
            Strategy::Large(strategy) => strategy.uncommit_regions(&mut self.core, start, count)?,
            Strategy::Small(strategy) => strategy.uncommit_regions(&mut self.core, start, count)?,
        }
        let pages = (self.core.stats.pages_uncommitted - pages_before) as usize;

        self.core.stats.uncommit_calls += 1;
        self.core.stats.regions_uncommitted += count as u64;

        log::debug!("uncommitted regions [{}, {}) ({} pages)", start, end, pages);
        if self.core.verbose {
            logging::log_event(MapperEvent::Uncommit { start, count, pages });
        }
        Ok(())
    }

    /// Notify the listener, if any, of committed regions
    pub(crate) fn fire_on_commit(&mut self, start: usize, count: usize, zero_filled: bool) {
        if let Some(listener) = &self.listener {
            listener.on_commit(start, count, zero_filled);
            self.core.stats.listener_notifications += 1;
        }
    }

    /// True if the region is committed
    pub fn is_committed(&self, region: usize) -> bool {
        region < self.core.commit_map.len() && self.core.commit_map.at(region)
    }

    /// Number of regions covering the reservation
    pub fn num_regions(&self) -> usize {
        self.core.commit_map.len()
    }

    /// Number of committed regions
    pub fn num_committed(&self) -> usize {
        self.core.commit_map.count_ones()
    }

    pub fn region_granularity(&self) -> usize {
        self.region_granularity
    }

    pub fn memory_type(&self) -> MemoryType {
        self.core.memory_type
    }

    /// Strategy chosen at construction
    pub fn kind(&self) -> MapperKind {
        match &self.strategy {
            Strategy::Large(strategy) => MapperKind::LargerThanCommitSize {
                pages_per_region: strategy.pages_per_region(),
            },
            Strategy::Small(strategy) => MapperKind::SmallerThanCommitSize {
                regions_per_page: strategy.regions_per_page(),
            },
        }
    }

    /// Number of committed regions on a page (small-region strategy only)
    pub fn page_refcount(&self, page: usize) -> Option<u32> {
        match &self.strategy {
            Strategy::Large(_) => None,
            Strategy::Small(strategy) => strategy.refcount(page),
        }
    }

    /// Backing page storage
    pub fn storage(&self) -> &S {
        &self.core.storage
    }

    /// Per-region commit state
    pub fn commit_map(&self) -> &CommitBitmap {
        &self.core.commit_map
    }

    pub fn stats(&self) -> &MapperStats {
        &self.core.stats
    }

    /// Check that the commit map, page refcounts and storage agree
    pub fn verify(&self) -> Result<()> {
        match &self.strategy {
            Strategy::Large(strategy) => strategy.verify(&self.core),
            Strategy::Small(strategy) => strategy.verify(&self.core),
        }
    }

    fn check_region_range(&self, start: usize, count: usize) -> Result<usize> {
        let limit = self.num_regions();
        match start.checked_add(count) {
            Some(end) if end <= limit => Ok(end),
            _ => Err(MapperError::RegionOutOfBounds { start, count, limit }),
        }
    }
}

impl<S: PageStorage> Drop for RegionToSpaceMapper<S> {
    fn drop(&mut self) {
        memtrack::release(self.core.storage.base());
    }
}

impl<S: PageStorage> std::fmt::Debug for RegionToSpaceMapper<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionToSpaceMapper")
            .field("kind", &self.kind())
            .field("base", &format_args!("{:#x}", self.core.storage.base()))
            .field("num_regions", &self.num_regions())
            .field("num_committed", &self.num_committed())
            .field("memory_type", &self.core.memory_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::os_page_size;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Calls(Mutex<Vec<(usize, usize, bool)>>);

    impl CommitListener for Calls {
        fn on_commit(&self, start: usize, count: usize, zero_filled: bool) {
            self.0.lock().push((start, count, zero_filled));
        }
    }

    fn config() -> MapperConfig {
        MapperConfig {
            numa_aware: false,
            ..Default::default()
        }
    }

    fn mapper(regions_bytes: usize, region_size: usize) -> RegionToSpaceMapper {
        let page_size = os_page_size();
        let rs = ReservedSpace::reserve(regions_bytes, page_size).unwrap();
        let size = rs.size();
        RegionToSpaceMapper::create_mapper(
            rs,
            size,
            page_size,
            region_size,
            1,
            MemoryType::Heap,
            &config(),
        )
        .unwrap()
    }

    #[test]
    fn test_strategy_selection() {
        let page_size = os_page_size();
        let large = mapper(16 * page_size, 2 * page_size);
        assert_eq!(
            large.kind(),
            MapperKind::LargerThanCommitSize { pages_per_region: 2 }
        );
        assert_eq!(large.num_regions(), 8);

        let equal = mapper(16 * page_size, page_size);
        assert_eq!(
            equal.kind(),
            MapperKind::LargerThanCommitSize { pages_per_region: 1 }
        );

        let small = mapper(4 * page_size, page_size / 4);
        assert_eq!(
            small.kind(),
            MapperKind::SmallerThanCommitSize { regions_per_page: 4 }
        );
        assert_eq!(small.num_regions(), 16);
    }

    #[test]
    fn test_commit_uncommit_real_storage() {
        let page_size = os_page_size();
        let mut m = mapper(16 * page_size, 2 * page_size);
        m.commit_regions(1, 3, None).unwrap();
        assert!(m.storage().is_area_committed(2, 6));
        assert_eq!(m.storage().committed_pages(), 6);
        m.verify().unwrap();

        m.uncommit_regions(1, 3).unwrap();
        assert_eq!(m.storage().committed_pages(), 0);
        m.verify().unwrap();
    }

    #[test]
    fn test_listener_set_once() {
        let page_size = os_page_size();
        let mut m = mapper(8 * page_size, page_size);
        let calls = Arc::new(Calls::default());
        m.set_mapping_changed_listener(calls.clone()).unwrap();
        assert!(matches!(
            m.set_mapping_changed_listener(calls.clone()),
            Err(MapperError::ListenerAlreadySet)
        ));

        m.commit_regions(2, 2, None).unwrap();
        assert_eq!(*calls.0.lock(), vec![(2, 2, true)]);
        assert_eq!(m.stats().listener_notifications, 1);
    }

    #[test]
    fn test_empty_commit_fires_listener() {
        let page_size = os_page_size();
        let mut m = mapper(8 * page_size, page_size);
        let calls = Arc::new(Calls::default());
        m.set_mapping_changed_listener(calls.clone()).unwrap();

        m.commit_regions(5, 0, None).unwrap();
        assert_eq!(*calls.0.lock(), vec![(5, 0, true)]);
        assert_eq!(m.storage().committed_pages(), 0);
    }

    #[test]
    fn test_notifications_counted_only_with_listener() {
        let page_size = os_page_size();
        let mut m = mapper(8 * page_size, page_size);
        m.fire_on_commit(0, 1, true);
        assert_eq!(m.stats().listener_notifications, 0);

        let calls = Arc::new(Calls::default());
        m.set_mapping_changed_listener(calls.clone()).unwrap();
        m.fire_on_commit(3, 2, false);
        assert_eq!(*calls.0.lock(), vec![(3, 2, false)]);
        assert_eq!(m.stats().listener_notifications, 1);
    }

    #[test]
    fn test_protocol_violations_leave_state_untouched() {
        let page_size = os_page_size();
        let mut m = mapper(8 * page_size, page_size);
        m.commit_regions(0, 2, None).unwrap();

        assert!(matches!(
            m.commit_regions(1, 2, None),
            Err(MapperError::InvariantViolated(_))
        ));
        assert!(!m.is_committed(2));

        assert!(matches!(
            m.uncommit_regions(1, 2),
            Err(MapperError::InvariantViolated(_))
        ));
        assert!(m.is_committed(1));

        assert!(matches!(
            m.commit_regions(7, 2, None),
            Err(MapperError::RegionOutOfBounds { limit: 8, .. })
        ));
        m.verify().unwrap();
    }

    #[test]
    fn test_rejects_bad_granularity() {
        let page_size = os_page_size();
        let rs = ReservedSpace::reserve(8 * page_size, page_size).unwrap();
        let size = rs.size();
        let err = RegionToSpaceMapper::create_mapper(
            rs,
            size,
            page_size,
            3 * page_size,
            1,
            MemoryType::Heap,
            &config(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            MapperError::NotPowerOfTwo {
                what: "region_granularity",
                ..
            }
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_memtrack_tag_lifetime() {
        let page_size = os_page_size();
        let m = mapper(8 * page_size, page_size);
        let base = m.storage().base();
        assert_eq!(
            memtrack::lookup(base).map(|range| range.memory_type),
            Some(MemoryType::Heap)
        );
        drop(m);
        assert!(memtrack::lookup(base).is_none());
    }

    #[test]
    fn test_used_size_limits_commit() {
        let page_size = os_page_size();
        let rs = ReservedSpace::reserve(8 * page_size, page_size).unwrap();
        let mut m = RegionToSpaceMapper::create_mapper(
            rs,
            4 * page_size,
            page_size,
            page_size,
            1,
            MemoryType::Other,
            &config(),
        )
        .unwrap();
        assert_eq!(m.num_regions(), 8);
        m.commit_regions(0, 4, None).unwrap();
        assert!(matches!(
            m.commit_regions(4, 1, None),
            Err(MapperError::PageOutOfBounds { .. })
        ));
        assert!(!m.is_committed(4));
    }
}
