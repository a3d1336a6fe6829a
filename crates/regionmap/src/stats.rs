//! Mapper Statistics - Export Counters
//!
//! Counters accumulated by one mapper, exportable as JSON or in the
//! Prometheus text format.

use indexmap::IndexMap;
use serde::Serialize;

/// MapperStats - commit activity counters
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MapperStats {
    /// Successful `commit_regions` calls
    pub commit_calls: u64,

    /// Successful `uncommit_regions` calls
    pub uncommit_calls: u64,

    /// Regions committed
    pub regions_committed: u64,

    /// Regions uncommitted
    pub regions_uncommitted: u64,

    /// Storage pages committed
    pub pages_committed: u64,

    /// Storage pages uncommitted
    pub pages_uncommitted: u64,

    /// Storage pages faulted in by pretouch
    pub pages_pretouched: u64,

    /// NUMA placement advisories issued
    pub numa_advisories: u64,

    /// Listener notifications delivered
    pub listener_notifications: u64,
}

impl MapperStats {
    /// Counters in export order
    pub fn metrics(&self) -> IndexMap<&'static str, u64> {
        let mut metrics = IndexMap::new();
        metrics.insert("regionmap_commit_calls_total", self.commit_calls);
        metrics.insert("regionmap_uncommit_calls_total", self.uncommit_calls);
        metrics.insert("regionmap_regions_committed_total", self.regions_committed);
        metrics.insert("regionmap_regions_uncommitted_total", self.regions_uncommitted);
        metrics.insert("regionmap_pages_committed_total", self.pages_committed);
        metrics.insert("regionmap_pages_uncommitted_total", self.pages_uncommitted);
        metrics.insert("regionmap_pages_pretouched_total", self.pages_pretouched);
        metrics.insert("regionmap_numa_advisories_total", self.numa_advisories);
        metrics.insert(
            "regionmap_listener_notifications_total",
            self.listener_notifications,
        );
        metrics
    }

    /// Export to Prometheus format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        for (name, value) in self.metrics() {
            output.push_str(&format!("# TYPE {} counter\n{} {}\n", name, name, value));
        }
        output
    }

    /// Export to JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
