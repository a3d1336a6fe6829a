//! Pretouch - Parallel Page Fault-In
//!
//! Touching every page of a freshly committed range forces the OS to back it
//! with physical memory now instead of on first mutator access.
//!
//! ## Work Distribution
//!
//! The range is cut into fixed-size chunks. Workers claim the next chunk by
//! bumping a shared cursor; there is no other shared mutable state. The
//! caller blocks until every worker has finished.
//!
//! ```text
//! [start ........................................ end)
//!  | chunk 0 | chunk 1 | chunk 2 | chunk 3 | tail |
//!     w0        w1        w0        w2       w1
//! ```

use crate::error::{MapperError, Result};
use crate::util::{align_up, is_power_of_two};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Smallest page a task can touch; each touch is one word at the page start.
pub const MIN_PAGE_SIZE: usize = std::mem::size_of::<usize>();

/// PretouchTask - one range to fault in
pub struct PretouchTask {
    /// First byte (page aligned)
    start: usize,
    /// End of range (exclusive)
    end: usize,
    /// Stride between touches
    page_size: usize,
    /// Bytes per claimed chunk, a multiple of `page_size`
    chunk_size: usize,
    /// Next unclaimed address
    cursor: AtomicUsize,
    /// Pages touched so far
    touched: AtomicUsize,
}

impl PretouchTask {
    /// Create task for `[start, end)`
    ///
    /// # Errors
    /// - `NotPowerOfTwo` if `page_size` is not a power of two
    /// - `Configuration` if `page_size` is below `MIN_PAGE_SIZE`
    /// - `InvariantViolated` if `start` is not page aligned or `end < start`
    pub fn new(start: usize, end: usize, page_size: usize, chunk_size: usize) -> Result<Self> {
        if !is_power_of_two(page_size) {
            return Err(MapperError::NotPowerOfTwo {
                what: "pretouch page_size",
                value: page_size,
            });
        }
        if page_size < MIN_PAGE_SIZE {
            return Err(MapperError::Configuration(format!(
                "pretouch page size {} below {} bytes",
                page_size, MIN_PAGE_SIZE
            )));
        }
        if start & (page_size - 1) != 0 || end < start {
            return Err(MapperError::InvariantViolated(format!(
                "invalid pretouch range [{:#x}, {:#x}) for page size {}",
                start, end, page_size
            )));
        }

        Ok(Self {
            start,
            end,
            page_size,
            chunk_size: align_up(chunk_size.max(1), page_size),
            cursor: AtomicUsize::new(start),
            touched: AtomicUsize::new(0),
        })
    }

    /// Number of chunks the range splits into
    pub fn num_chunks(&self) -> usize {
        (self.end - self.start).div_ceil(self.chunk_size)
    }

    /// Pages touched so far
    pub fn touched_pages(&self) -> usize {
        self.touched.load(Ordering::Relaxed)
    }

    /// Claim and touch chunks until the range is exhausted
    pub fn work(&self, worker_id: usize) {
        let mut pages = 0usize;
        loop {
            let chunk_start = self.cursor.fetch_add(self.chunk_size, Ordering::Relaxed);
            if chunk_start >= self.end {
                break;
            }
            let chunk_end = chunk_start.saturating_add(self.chunk_size).min(self.end);
            pages += self.touch_range(chunk_start, chunk_end);
        }
        self.touched.fetch_add(pages, Ordering::Relaxed);
        log::trace!("pretouch worker {} touched {} pages", worker_id, pages);
    }

    fn touch_range(&self, start: usize, end: usize) -> usize {
        let mut count = 0;
        let mut addr = start;
        while addr < end {
            // Safety: the range was committed by the caller and is page
            // aligned; pages are at least MIN_PAGE_SIZE bytes, so every page
            // start is aligned for an AtomicUsize. Adding zero
            // faults the page in for writing without changing its contents,
            // even if another thread is using the memory concurrently.
            unsafe {
                (*(addr as *const AtomicUsize)).fetch_add(0, Ordering::Relaxed);
            }
            count += 1;
            addr += self.page_size;
        }
        count
    }
}

/// WorkerPool - threads used for pretouch
///
/// Threads are scoped to a single `run_task` call and always joined before
/// it returns.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    /// Create pool with `workers` threads
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(MapperError::Configuration(
                "worker pool needs at least one worker".to_string(),
            ));
        }
        Ok(Self { workers })
    }

    /// Create pool sized to the machine
    pub fn with_default_workers() -> Self {
        Self {
            workers: num_cpus::get().max(1),
        }
    }

    /// Number of threads the pool may use
    pub fn active_workers(&self) -> usize {
        self.workers
    }

    /// Run `task` to completion
    ///
    /// Uses `min(active_workers, chunks)` threads. A single chunk runs on the
    /// calling thread.
    pub fn run_task(&self, task: &PretouchTask) -> Result<()> {
        let num_workers = self.workers.min(task.num_chunks());
        if num_workers <= 1 {
            task.work(0);
            return Ok(());
        }

        log::debug!(
            "pretouch [{:#x}, {:#x}) with {} workers, {} chunks",
            task.start,
            task.end,
            num_workers,
            task.num_chunks()
        );

        crossbeam::thread::scope(|scope| {
            for worker_id in 0..num_workers {
                scope
                    .builder()
                    .name(format!("pretouch-worker-{}", worker_id))
                    .spawn(move |_| task.work(worker_id))
                    .map_err(|e| {
                        MapperError::Internal(format!("failed to spawn pretouch worker: {}", e))
                    })?;
            }
            Ok(())
        })
        .map_err(|_| MapperError::Internal("pretouch worker panicked".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(pages: usize, page_size: usize) -> Vec<usize> {
        // Over-allocate so a page-aligned window fits.
        vec![0usize; (pages + 1) * page_size / std::mem::size_of::<usize>()]
    }

    fn aligned_start(buf: &[usize], page_size: usize) -> usize {
        align_up(buf.as_ptr() as usize, page_size)
    }

    #[test]
    fn test_task_chunks() {
        let task = PretouchTask::new(0x10000, 0x10000 + 10 * 4096, 4096, 3 * 4096).unwrap();
        assert_eq!(task.num_chunks(), 4);
    }

    #[test]
    fn test_chunk_size_rounded_to_page() {
        let task = PretouchTask::new(0, 8192, 4096, 100).unwrap();
        assert_eq!(task.num_chunks(), 2);
    }

    #[test]
    fn test_rejects_unaligned_start() {
        assert!(matches!(
            PretouchTask::new(100, 8192, 4096, 4096),
            Err(MapperError::InvariantViolated(_))
        ));
        assert!(matches!(
            PretouchTask::new(0, 8192, 3000, 4096),
            Err(MapperError::NotPowerOfTwo { .. })
        ));
    }

    #[test]
    fn test_rejects_pages_below_word_size() {
        assert!(matches!(
            PretouchTask::new(0, 64, 2, 16),
            Err(MapperError::Configuration(_))
        ));
        assert!(PretouchTask::new(0, 64, MIN_PAGE_SIZE, 16).is_ok());
    }

    #[test]
    fn test_inline_touch_preserves_contents() {
        let page_size = 4096;
        let mut buf = buffer(4, page_size);
        let start = aligned_start(&buf, page_size);
        let offset = (start - buf.as_ptr() as usize) / std::mem::size_of::<usize>();
        buf[offset] = 42;

        let task = PretouchTask::new(start, start + 4 * page_size, page_size, 4 * page_size)
            .unwrap();
        task.work(0);

        assert_eq!(task.touched_pages(), 4);
        assert_eq!(buf[offset], 42);
    }

    #[test]
    fn test_parallel_touch_covers_every_page() {
        let page_size = 4096;
        let pages = 64;
        let buf = buffer(pages, page_size);
        let start = aligned_start(&buf, page_size);

        let task = PretouchTask::new(start, start + pages * page_size, page_size, 2 * page_size)
            .unwrap();
        let pool = WorkerPool::new(4).unwrap();
        pool.run_task(&task).unwrap();

        assert_eq!(task.touched_pages(), pages);
    }

    #[test]
    fn test_empty_range() {
        let task = PretouchTask::new(0x1000, 0x1000, 4096, 4096).unwrap();
        assert_eq!(task.num_chunks(), 0);
        WorkerPool::new(2).unwrap().run_task(&task).unwrap();
        assert_eq!(task.touched_pages(), 0);
    }

    #[test]
    fn test_pool_requires_worker() {
        assert!(WorkerPool::new(0).is_err());
        assert!(WorkerPool::with_default_workers().active_workers() >= 1);
    }
}
