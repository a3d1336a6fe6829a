//! Memory tracking - tags reserved address ranges with their use.
//!
//! Tagging has no effect on mapping behavior. It lets diagnostics answer
//! "what is this address for" and summarize reserved bytes per memory type.

use crate::mapper::MemoryType;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Tagged reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedRange {
    pub base: usize,
    pub size: usize,
    pub memory_type: MemoryType,
}

lazy_static::lazy_static! {
    static ref TRACKED: Mutex<BTreeMap<usize, TrackedRange>> = Mutex::new(BTreeMap::new());
}

/// Record the memory type of the reservation starting at `base`
///
/// Re-recording the same base replaces the previous tag.
pub fn record_virtual_memory_type(base: usize, size: usize, memory_type: MemoryType) {
    log::trace!(
        "memtrack: [{:#x}, {:#x}) tagged {:?}",
        base,
        base.saturating_add(size),
        memory_type
    );
    TRACKED.lock().insert(
        base,
        TrackedRange {
            base,
            size,
            memory_type,
        },
    );
}

/// Remove the tag for the reservation starting at `base`
pub fn release(base: usize) -> Option<TrackedRange> {
    TRACKED.lock().remove(&base)
}

/// Find the tagged reservation containing `address`
pub fn lookup(address: usize) -> Option<TrackedRange> {
    let tracked = TRACKED.lock();
    tracked
        .range(..=address)
        .next_back()
        .map(|(_, range)| *range)
        .filter(|range| address < range.base.saturating_add(range.size))
}

/// Total tagged bytes for one memory type
pub fn reserved_bytes(memory_type: MemoryType) -> usize {
    TRACKED
        .lock()
        .values()
        .filter(|range| range.memory_type == memory_type)
        .map(|range| range.size)
        .sum()
}
