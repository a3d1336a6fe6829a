//! Mapper Event Logging
//!
//! Structured events for heap commit activity, useful for:
//! - Tracking heap expansion and shrinking
//! - Correlating page faults with pretouch
//! - Verifying NUMA placement
//!
//! Log Levels:
//! - INFO: Mapper creation
//! - DEBUG: Commit, uncommit, pretouch
//! - TRACE: Per-region NUMA advisories
//!
//! Call sites in the crate use the `log` macros for free-form diagnostics.
//! Events go through this logger only when `MapperConfig::verbose` is set.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Log level for mapper events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

/// Mapper event types
#[derive(Debug, Clone, PartialEq)]
pub enum MapperEvent {
    /// Mapper constructed
    MapperCreated {
        strategy: String,
        base: usize,
        num_regions: usize,
        region_granularity: usize,
        commit_granularity: usize,
    },

    /// Regions committed
    Commit {
        start: usize,
        count: usize,
        pages: usize,
        zero_filled: bool,
    },

    /// Regions uncommitted
    Uncommit {
        start: usize,
        count: usize,
        pages: usize,
    },

    /// Pages faulted in
    Pretouch {
        start_page: usize,
        pages: usize,
        workers: usize,
    },

    /// NUMA placement requested
    NumaAdvice {
        region: usize,
        address: usize,
        size: usize,
    },
}

/// Mapper logger configuration
#[derive(Debug, Clone)]
pub struct MapperLoggerConfig {
    /// Minimum log level
    pub level: LogLevel,

    /// Enable console output
    pub console: bool,

    /// Enable JSON format
    pub json: bool,

    /// Enable timestamps
    pub timestamps: bool,

    /// Events kept in memory; oldest are dropped first
    pub max_events: usize,
}

impl Default for MapperLoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Debug,
            console: false,
            json: false,
            timestamps: true,
            max_events: 4096,
        }
    }
}

/// Mapper logger - bounded event store with optional console output
pub struct MapperLogger {
    config: MapperLoggerConfig,
    events: Mutex<VecDeque<(Instant, MapperEvent)>>,
    enabled: AtomicBool,
}

impl MapperLogger {
    /// Create new mapper logger
    pub fn new(config: MapperLoggerConfig) -> Self {
        Self {
            config,
            events: Mutex::new(VecDeque::new()),
            enabled: AtomicBool::new(true),
        }
    }

    /// Enable logging
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Disable logging
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Check if logging is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Log a mapper event
    pub fn log(&self, event: MapperEvent) {
        if !self.is_enabled() || self.config.max_events == 0 {
            return;
        }
        if event_level(&event) > self.config.level {
            return;
        }

        if self.config.console {
            self.output_console(&event);
        }

        let mut events = self.events.lock();
        while events.len() >= self.config.max_events {
            events.pop_front();
        }
        events.push_back((Instant::now(), event));
    }

    fn output_console(&self, event: &MapperEvent) {
        let line = if self.config.json {
            match serde_json::to_string(&event_json(event)) {
                Ok(line) => line,
                Err(_) => return,
            }
        } else {
            event_human(event)
        };

        if self.config.timestamps {
            let now = chrono::Local::now();
            println!("[{}] {}", now.format("%Y-%m-%d %H:%M:%S%.3f"), line);
        } else {
            println!("{}", line);
        }
    }

    /// Get all stored events, oldest first
    pub fn get_events(&self) -> Vec<(Instant, MapperEvent)> {
        self.events.lock().iter().cloned().collect()
    }

    /// Clear all events
    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    /// Get event count
    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }
}

impl Default for MapperLogger {
    fn default() -> Self {
        Self::new(MapperLoggerConfig::default())
    }
}

fn event_level(event: &MapperEvent) -> LogLevel {
    match event {
        MapperEvent::MapperCreated { .. } => LogLevel::Info,
        MapperEvent::Commit { .. } | MapperEvent::Uncommit { .. } | MapperEvent::Pretouch { .. } => {
            LogLevel::Debug
        },
        MapperEvent::NumaAdvice { .. } => LogLevel::Trace,
    }
}

fn event_human(event: &MapperEvent) -> String {
    match event {
        MapperEvent::MapperCreated {
            strategy,
            base,
            num_regions,
            region_granularity,
            commit_granularity,
        } => format!(
            "[regionmap] {} mapper at {:#x}: {} regions of {} bytes, commit granularity {}",
            strategy, base, num_regions, region_granularity, commit_granularity
        ),
        MapperEvent::Commit {
            start,
            count,
            pages,
            zero_filled,
        } => format!(
            "[regionmap] Committed regions [{}, {}) ({} pages, zero_filled={})",
            start,
            start + count,
            pages,
            zero_filled
        ),
        MapperEvent::Uncommit {
            start,
            count,
            pages,
        } => format!(
            "[regionmap] Uncommitted regions [{}, {}) ({} pages)",
            start,
            start + count,
            pages
        ),
        MapperEvent::Pretouch {
            start_page,
            pages,
            workers,
        } => format!(
            "[regionmap] Pretouched pages [{}, {}) on {} workers",
            start_page,
            start_page + pages,
            workers
        ),
        MapperEvent::NumaAdvice {
            region,
            address,
            size,
        } => format!(
            "[regionmap] NUMA advice for region {}: [{:#x}, {:#x})",
            region,
            address,
            address + size
        ),
    }
}

fn event_json(event: &MapperEvent) -> serde_json::Value {
    match event {
        MapperEvent::MapperCreated {
            strategy,
            base,
            num_regions,
            region_granularity,
            commit_granularity,
        } => serde_json::json!({
            "type": "mapper_created",
            "strategy": strategy,
            "base": base,
            "num_regions": num_regions,
            "region_granularity": region_granularity,
            "commit_granularity": commit_granularity
        }),
        MapperEvent::Commit {
            start,
            count,
            pages,
            zero_filled,
        } => serde_json::json!({
            "type": "commit",
            "start": start,
            "count": count,
            "pages": pages,
            "zero_filled": zero_filled
        }),
        MapperEvent::Uncommit {
            start,
            count,
            pages,
        } => serde_json::json!({
            "type": "uncommit",
            "start": start,
            "count": count,
            "pages": pages
        }),
        MapperEvent::Pretouch {
            start_page,
            pages,
            workers,
        } => serde_json::json!({
            "type": "pretouch",
            "start_page": start_page,
            "pages": pages,
            "workers": workers
        }),
        MapperEvent::NumaAdvice {
            region,
            address,
            size,
        } => serde_json::json!({
            "type": "numa_advice",
            "region": region,
            "address": address,
            "size": size
        }),
    }
}

/// Global mapper logger
lazy_static::lazy_static! {
    static ref GLOBAL_LOGGER: Mutex<MapperLogger> = Mutex::new(MapperLogger::default());
}

/// Log a mapper event to global logger
pub fn log_event(event: MapperEvent) {
    GLOBAL_LOGGER.lock().log(event);
}

/// Configure global logger
pub fn configure_logger(config: MapperLoggerConfig) {
    *GLOBAL_LOGGER.lock() = MapperLogger::new(config);
}

/// Get global logger event count
pub fn get_event_count() -> usize {
    GLOBAL_LOGGER.lock().event_count()
}

/// Get a copy of the global logger's events
pub fn get_events() -> Vec<MapperEvent> {
    GLOBAL_LOGGER
        .lock()
        .get_events()
        .into_iter()
        .map(|(_, event)| event)
        .collect()
}
