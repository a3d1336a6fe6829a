//! Test Utilities for the regionmap Test Suite
//!
//! Recording collaborators stand in for the OS layer so tests can assert on
//! the exact page ranges, advisories and notifications a mapper produces.

#![allow(dead_code)]

use parking_lot::Mutex;
use regionmap::{
    CommitListener, MapperConfig, MapperError, MemoryType, NumaPlacement, PageStorage,
    RegionToSpaceMapper, Result, WorkerPool,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Page size used by recording fixtures
pub const PAGE_SIZE: usize = 4096;

// Fake bases are spaced apart so memory tags of concurrent tests never meet.
static NEXT_BASE: AtomicUsize = AtomicUsize::new(0x6000_0000_0000);

fn next_base() -> usize {
    NEXT_BASE.fetch_add(0x1_0000_0000, Ordering::Relaxed)
}

/// ============================================================================
/// RECORDING STORAGE
/// ============================================================================

/// Page storage that only does bookkeeping and records every call
pub struct RecordingStorage {
    base: usize,
    page_size: usize,
    committable_pages: usize,
    committed: Vec<bool>,

    /// `(start_page, pages)` of each commit call
    pub commits: Vec<(usize, usize)>,

    /// `(start_page, pages)` of each uncommit call
    pub uncommits: Vec<(usize, usize)>,

    /// `(start_page, pages, workers)` of each pretouch call
    pub pretouches: Mutex<Vec<(usize, usize, usize)>>,

    zero_fill_script: VecDeque<bool>,
    fail_commits: bool,
    fail_pretouches: bool,
}

impl RecordingStorage {
    /// Storage of `pages` pages, all committable
    pub fn new(page_size: usize, pages: usize) -> Self {
        Self::with_used_pages(page_size, pages, pages)
    }

    /// Storage of `pages` pages where only the first `used_pages` may be
    /// committed
    pub fn with_used_pages(page_size: usize, pages: usize, used_pages: usize) -> Self {
        Self {
            base: next_base(),
            page_size,
            committable_pages: used_pages,
            committed: vec![false; pages],
            commits: Vec::new(),
            uncommits: Vec::new(),
            pretouches: Mutex::new(Vec::new()),
            zero_fill_script: VecDeque::new(),
            fail_commits: false,
            fail_pretouches: false,
        }
    }

    /// Queue results for upcoming commit calls; unscripted commits return true
    pub fn script_zero_filled(&mut self, results: &[bool]) {
        self.zero_fill_script.extend(results.iter().copied());
    }

    /// Make every following commit fail like an exhausted OS
    pub fn fail_commits(&mut self) {
        self.fail_commits = true;
    }

    /// Make every following pretouch fail like a worker that cannot start
    pub fn fail_pretouches(&mut self) {
        self.fail_pretouches = true;
    }

    /// Total pages passed to commit
    pub fn pages_committed(&self) -> usize {
        self.commits.iter().map(|&(_, pages)| pages).sum()
    }

    /// Indices of currently committed pages
    pub fn committed_pages(&self) -> Vec<usize> {
        (0..self.committed.len()).filter(|&p| self.committed[p]).collect()
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
}

impl PageStorage for RecordingStorage {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn base(&self) -> usize {
        self.base
    }

    fn reserved_size(&self) -> usize {
        self.committed.len() * self.page_size
    }

    fn committable_pages(&self) -> usize {
        self.committable_pages
    }

    fn commit(&mut self, start_page: usize, pages: usize) -> Result<bool> {
        let end = self.check_range(start_page, pages)?;
        if self.fail_commits {
            return Err(MapperError::VirtualMemoryError("ENOMEM".to_string()));
        }
        if let Some(page) = (start_page..end).find(|&p| self.committed[p]) {
            return Err(MapperError::InvariantViolated(format!(
                "page {} already committed",
                page
            )));
        }
        self.committed[start_page..end].fill(true);
        self.commits.push((start_page, pages));
        Ok(self.zero_fill_script.pop_front().unwrap_or(true))
    }

    fn uncommit(&mut self, start_page: usize, pages: usize) -> Result<()> {
        let end = self.check_range(start_page, pages)?;
        if let Some(page) = (start_page..end).find(|&p| !self.committed[p]) {
            return Err(MapperError::InvariantViolated(format!(
                "page {} not committed",
                page
            )));
        }
        self.committed[start_page..end].fill(false);
        self.uncommits.push((start_page, pages));
        Ok(())
    }

    fn pretouch(&self, start_page: usize, pages: usize, pool: Option<&WorkerPool>) -> Result<()> {
        if self.fail_pretouches {
            return Err(MapperError::Internal(
                "failed to spawn pretouch worker".to_string(),
            ));
        }
        let workers = pool.map_or(1, WorkerPool::active_workers);
        self.pretouches.lock().push((start_page, pages, workers));
        Ok(())
    }

    fn is_committed(&self, page: usize) -> bool {
        self.committed.get(page).copied().unwrap_or(false)
    }
}

/// ============================================================================
/// RECORDING LISTENER
/// ============================================================================

/// Listener recording every `on_commit` call
#[derive(Default)]
pub struct RecordingListener {
    calls: Mutex<Vec<(usize, usize, bool)>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<(usize, usize, bool)> {
        self.calls.lock().clone()
    }
}

impl CommitListener for RecordingListener {
    fn on_commit(&self, start_index: usize, num_regions: usize, zero_filled: bool) {
        self.calls.lock().push((start_index, num_regions, zero_filled));
    }
}

/// ============================================================================
/// RECORDING NUMA
/// ============================================================================

/// NUMA collaborator recording `(address, size, region_index)` advisories
pub struct RecordingNuma {
    nodes: usize,
    requests: Mutex<Vec<(usize, usize, usize)>>,
}

impl RecordingNuma {
    pub fn new(nodes: usize) -> Arc<Self> {
        Arc::new(Self {
            nodes,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<(usize, usize, usize)> {
        self.requests.lock().clone()
    }
}

impl NumaPlacement for RecordingNuma {
    fn num_active_nodes(&self) -> usize {
        self.nodes
    }

    fn request_memory_on_node(&self, address: usize, size: usize, region_index: usize) {
        self.requests.lock().push((address, size, region_index));
    }
}

/// ============================================================================
/// MAPPER FIXTURE
/// ============================================================================

/// Configuration used by fixtures: no global NUMA, no eager touch
pub fn test_config() -> MapperConfig {
    MapperConfig {
        numa_aware: false,
        ..Default::default()
    }
}

/// Mapper over recording collaborators
pub struct MapperFixture {
    pub mapper: RegionToSpaceMapper<RecordingStorage>,
    pub listener: Arc<RecordingListener>,
    pub numa: Arc<RecordingNuma>,
}

impl MapperFixture {
    /// Heap mapper over `pages` pages of `PAGE_SIZE` with commit factor 1
    pub fn heap(pages: usize, region_granularity: usize) -> Self {
        Self::build(
            RecordingStorage::new(PAGE_SIZE, pages),
            region_granularity,
            MemoryType::Heap,
            &test_config(),
        )
    }

    /// Mapper with explicit storage, memory type and config
    pub fn build(
        storage: RecordingStorage,
        region_granularity: usize,
        memory_type: MemoryType,
        config: &MapperConfig,
    ) -> Self {
        let numa = RecordingNuma::new(2);
        let listener = RecordingListener::new();
        let mut mapper =
            RegionToSpaceMapper::with_storage(storage, region_granularity, 1, memory_type, config)
                .unwrap_or_else(|e| panic!("mapper construction failed: {}", e))
                .with_numa(numa.clone());
        mapper
            .set_mapping_changed_listener(listener.clone())
            .unwrap_or_else(|e| panic!("listener registration failed: {}", e));

        Self {
            mapper,
            listener,
            numa,
        }
    }

    pub fn storage(&self) -> &RecordingStorage {
        self.mapper.storage()
    }

    /// Bits `[0, num_regions)` of the commit map
    pub fn bits(&self) -> Vec<bool> {
        (0..self.mapper.num_regions())
            .map(|region| self.mapper.is_committed(region))
            .collect()
    }
}

/// Assert the mapper's internal bookkeeping is consistent
pub fn assert_consistent<S: PageStorage>(mapper: &RegionToSpaceMapper<S>) {
    if let Err(e) = mapper.verify() {
        panic!("mapper state inconsistent: {}", e);
    }
}
