//! NUMA (Non-Uniform Memory Access) Placement
//!
//! On multi-socket systems memory access to the local node is faster than to
//! a remote node. The mapper asks for freshly committed heap pages to be
//! placed on a preferred node chosen from the region index, so consecutive
//! regions are spread round-robin over the active nodes.
//!
//! NUMA Architecture:
//! ```text
//! ┌─────────────┐     ┌─────────────┐
//! │  CPU Node 0 │     │  CPU Node 1 │
//! │  ┌───────┐  │     │  ┌───────┐  │
//! │  │ Cores │  │     │  │ Cores │  │
//! │  └───┬───┘  │     │  └───┬───┘  │
//! │  ┌───▼───┐  │     │  ┌───▼───┐  │
//! │  │ Local │  │     │  │ Local │  │
//! │  │ Memory│  │     │  │ Memory│  │
//! │  └───────┘  │     │  └───────┘  │
//! └─────────────┘     └─────────────┘
//!       └────────┬──────────┘
//!         Interconnect (slower access)
//! ```
//!
//! Placement is a hint. A failed advisory never fails the commit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Placement collaborator used by the mapper
pub trait NumaPlacement: Send + Sync {
    /// Number of nodes regions are spread over
    fn num_active_nodes(&self) -> usize;

    /// Ask the OS to back `[address, address + size)` on the node preferred
    /// for `region_index`
    fn request_memory_on_node(&self, address: usize, size: usize, region_index: usize);
}

/// Placement that ignores all advisories
#[derive(Debug, Default, Clone, Copy)]
pub struct NoNuma;

impl NumaPlacement for NoNuma {
    fn num_active_nodes(&self) -> usize {
        1
    }

    fn request_memory_on_node(&self, _address: usize, _size: usize, _region_index: usize) {}
}

/// NumaManager - maps region indices to nodes and binds memory
pub struct NumaManager {
    /// OS node ids, in ascending order
    node_ids: Vec<usize>,

    /// Heap region size in bytes (0 until `set_region_info`)
    region_size: AtomicUsize,

    /// Page size used by the heap (0 until `set_region_info`)
    page_size: AtomicUsize,

    /// Advisories issued per node index
    requests: Vec<AtomicUsize>,

    /// Advisories the OS rejected
    failed_requests: AtomicUsize,
}

impl NumaManager {
    /// Create manager for the detected topology
    pub fn new() -> Self {
        Self::with_nodes(detect_numa_nodes())
    }

    /// Create manager for an explicit node id list
    ///
    /// An empty list is treated as a single node 0.
    pub fn with_nodes(mut node_ids: Vec<usize>) -> Self {
        if node_ids.is_empty() {
            node_ids.push(0);
        }
        node_ids.sort_unstable();
        node_ids.dedup();

        let requests = node_ids.iter().map(|_| AtomicUsize::new(0)).collect();

        Self {
            node_ids,
            region_size: AtomicUsize::new(0),
            page_size: AtomicUsize::new(0),
            requests,
            failed_requests: AtomicUsize::new(0),
        }
    }

    /// Record heap geometry used for node selection
    pub fn set_region_info(&self, region_size: usize, page_size: usize) {
        self.region_size.store(region_size, Ordering::Relaxed);
        self.page_size.store(page_size, Ordering::Relaxed);
    }

    /// Active OS node ids
    pub fn node_ids(&self) -> &[usize] {
        &self.node_ids
    }

    /// Index into `node_ids` preferred for a region
    ///
    /// Regions larger than a page rotate over nodes one by one. When several
    /// regions share a page they must land on the same node, so the rotation
    /// steps once per page.
    pub fn preferred_node_index_for_index(&self, region_index: usize) -> usize {
        let nodes = self.node_ids.len();
        if nodes == 1 {
            return 0;
        }
        let region_size = self.region_size.load(Ordering::Relaxed);
        let page_size = self.page_size.load(Ordering::Relaxed);
        if region_size == 0 || page_size == 0 || region_size >= page_size {
            region_index % nodes
        } else {
            let regions_per_page = page_size / region_size;
            (region_index / regions_per_page) % nodes
        }
    }

    /// Get statistics for node index
    pub fn node_stats(&self, node_index: usize) -> Option<NumaNodeStats> {
        let requests = self.requests.get(node_index)?;
        Some(NumaNodeStats {
            node_id: self.node_ids[node_index],
            requests: requests.load(Ordering::Relaxed),
        })
    }

    /// Advisories rejected by the OS
    pub fn failed_requests(&self) -> usize {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

impl Default for NumaManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NumaPlacement for NumaManager {
    fn num_active_nodes(&self) -> usize {
        self.node_ids.len()
    }

    fn request_memory_on_node(&self, address: usize, size: usize, region_index: usize) {
        if self.node_ids.len() <= 1 || size == 0 {
            return;
        }

        let node_index = self.preferred_node_index_for_index(region_index);
        self.requests[node_index].fetch_add(1, Ordering::Relaxed);

        let node_id = self.node_ids[node_index];
        if let Err(e) = bind_memory_to_node(address, size, node_id) {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "NUMA advisory for [{:#x}, {:#x}) on node {} ignored: {}",
                address,
                address + size,
                node_id,
                e
            );
        }
    }
}

/// Statistics for NUMA node
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NumaNodeStats {
    /// OS node id
    pub node_id: usize,
    /// Placement advisories issued
    pub requests: usize,
}

lazy_static::lazy_static! {
    static ref GLOBAL_NUMA: Arc<NumaManager> = Arc::new(NumaManager::new());
}

/// Process-wide NUMA manager
pub fn global() -> Arc<NumaManager> {
    Arc::clone(&GLOBAL_NUMA)
}

/// Detect the online NUMA node ids
fn detect_numa_nodes() -> Vec<usize> {
    #[cfg(target_os = "linux")]
    {
        match std::fs::read_to_string("/sys/devices/system/node/online") {
            Ok(online) => {
                let nodes = parse_node_list(online.trim());
                if !nodes.is_empty() {
                    return nodes;
                }
                log::warn!("Unreadable NUMA node list {:?}, assuming one node", online);
            },
            Err(e) => {
                log::debug!("NUMA topology unavailable ({}), assuming one node", e);
            },
        }
    }

    vec![0]
}

/// Parse a kernel node list such as `0`, `0-3` or `0,2-3`
fn parse_node_list(list: &str) -> Vec<usize> {
    let mut nodes = Vec::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => match (lo.parse::<usize>(), hi.parse::<usize>()) {
                (Ok(lo), Ok(hi)) if lo <= hi => nodes.extend(lo..=hi),
                _ => return Vec::new(),
            },
            None => match part.parse::<usize>() {
                Ok(node) => nodes.push(node),
                Err(_) => return Vec::new(),
            },
        }
    }
    nodes
}

#[cfg(target_os = "linux")]
fn bind_memory_to_node(address: usize, size: usize, node_id: usize) -> std::io::Result<()> {
    const MPOL_PREFERRED: libc::c_long = 1;

    if node_id >= u64::BITS as usize {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("node id {} exceeds nodemask", node_id),
        ));
    }
    let nodemask: u64 = 1 << node_id;
    // The kernel reads maxnode - 1 bits of the mask.
    let maxnode = u64::BITS as libc::c_ulong + 1;

    // Safety: mbind only changes the placement policy of the given range of
    // our own mapping; the nodemask pointer is valid for the call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            address as *mut libc::c_void,
            size as libc::c_ulong,
            MPOL_PREFERRED,
            &nodemask as *const u64,
            maxnode,
            0 as libc::c_uint,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn bind_memory_to_node(_address: usize, _size: usize, _node_id: usize) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "NUMA binding not supported on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node_list() {
        assert_eq!(parse_node_list("0"), vec![0]);
        assert_eq!(parse_node_list("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_node_list("0,2-3"), vec![0, 2, 3]);
        assert!(parse_node_list("x").is_empty());
        assert!(parse_node_list("3-1").is_empty());
    }

    #[test]
    fn test_single_node_is_noop() {
        let numa = NumaManager::with_nodes(vec![0]);
        numa.request_memory_on_node(0x1000, 0x1000, 7);
        assert_eq!(numa.node_stats(0).unwrap().requests, 0);
        assert_eq!(numa.preferred_node_index_for_index(7), 0);
    }

    #[test]
    fn test_region_larger_than_page_rotates_per_region() {
        let numa = NumaManager::with_nodes(vec![0, 1]);
        numa.set_region_info(1 << 20, 4096);
        assert_eq!(numa.preferred_node_index_for_index(0), 0);
        assert_eq!(numa.preferred_node_index_for_index(1), 1);
        assert_eq!(numa.preferred_node_index_for_index(2), 0);
    }

    #[test]
    fn test_regions_sharing_page_share_node() {
        let numa = NumaManager::with_nodes(vec![0, 1]);
        numa.set_region_info(1024, 4096);
        for region in 0..4 {
            assert_eq!(numa.preferred_node_index_for_index(region), 0);
        }
        assert_eq!(numa.preferred_node_index_for_index(4), 1);
    }

    #[test]
    fn test_empty_node_list_defaults_to_node_zero() {
        let numa = NumaManager::with_nodes(Vec::new());
        assert_eq!(numa.node_ids(), &[0]);
        assert_eq!(numa.num_active_nodes(), 1);
    }

    #[test]
    fn test_no_numa() {
        assert_eq!(NoNuma.num_active_nodes(), 1);
        NoNuma.request_memory_on_node(0, 4096, 0);
    }
}
