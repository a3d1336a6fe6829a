//! Configuration Module - Mapper Tuning Parameters
//!
//! Policy knobs that affect how committed memory is prepared. Region size and
//! commit factor are not configured here; they belong to the heap that owns
//! the mapper and are passed at construction.

use crate::util::constants::MB;

/// Configuration shared by all mappers of a heap
///
/// # Examples
///
/// ```rust
/// use regionmap::MapperConfig;
///
/// // Use default configuration
/// let config = MapperConfig::default();
/// assert!(!config.always_pretouch);
///
/// // Fault in every committed page eagerly on 4 workers
/// let config = MapperConfig {
///     always_pretouch: true,
///     pretouch_workers: Some(4),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct MapperConfig {
    /// Touch every freshly committed page before `commit_regions` returns
    ///
    /// Moves page-fault cost from the mutator to heap expansion.
    /// Default: false
    pub always_pretouch: bool,

    /// Number of pretouch worker threads
    ///
    /// If None, `WorkerPool::with_default_workers` uses the CPU count.
    /// Default: None
    pub pretouch_workers: Option<usize>,

    /// Bytes claimed per pretouch work unit
    ///
    /// Rounded up to the storage page size.
    /// Default: 1MB
    pub pretouch_chunk_size: usize,

    /// Issue NUMA placement advisories for heap memory
    ///
    /// Default: true
    pub numa_aware: bool,

    /// Emit mapper events to the global logger
    ///
    /// Default: false
    pub verbose: bool,
}

impl Default for MapperConfig {
    fn default() -> Self {
        MapperConfig {
            always_pretouch: false,
            pretouch_workers: None,
            pretouch_chunk_size: MB,
            numa_aware: true,
            verbose: false,
        }
    }
}

impl MapperConfig {
    /// Validate configuration
    ///
    /// # Examples
    ///
    /// ```rust
    /// use regionmap::MapperConfig;
    ///
    /// let config = MapperConfig {
    ///     pretouch_chunk_size: 0,  // Invalid!
    ///     ..Default::default()
    /// };
    ///
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pretouch_chunk_size == 0 {
            return Err(ConfigError::InvalidChunkSize(
                "pretouch_chunk_size must be > 0".to_string(),
            ));
        }

        if let Some(workers) = self.pretouch_workers {
            if workers == 0 {
                return Err(ConfigError::InvalidWorkers(
                    "pretouch_workers must be > 0".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Build configuration from environment variables
    ///
    /// Overrides defaults with environment variables:
    /// - REGIONMAP_ALWAYS_PRETOUCH
    /// - REGIONMAP_PRETOUCH_WORKERS
    /// - REGIONMAP_PRETOUCH_CHUNK
    /// - REGIONMAP_NUMA
    /// - REGIONMAP_VERBOSE
    ///
    /// # Examples
    ///
    /// ```bash
    /// export REGIONMAP_ALWAYS_PRETOUCH=1
    /// export REGIONMAP_PRETOUCH_WORKERS=8
    /// export REGIONMAP_PRETOUCH_CHUNK=4194304  # 4MB
    /// ```
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("REGIONMAP_ALWAYS_PRETOUCH") {
            config.always_pretouch = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("REGIONMAP_PRETOUCH_WORKERS") {
            if let Ok(workers) = val.parse::<usize>() {
                config.pretouch_workers = Some(workers);
            }
        }

        if let Ok(val) = std::env::var("REGIONMAP_PRETOUCH_CHUNK") {
            if let Ok(size) = val.parse::<usize>() {
                config.pretouch_chunk_size = size;
            }
        }

        if let Ok(val) = std::env::var("REGIONMAP_NUMA") {
            config.numa_aware = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("REGIONMAP_VERBOSE") {
            config.verbose = parse_flag(&val);
        }

        config
    }
}

fn parse_flag(val: &str) -> bool {
    val == "1" || val.eq_ignore_ascii_case("true")
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid pretouch chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("Invalid pretouch workers: {0}")]
    InvalidWorkers(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MapperConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.always_pretouch);
        assert!(config.numa_aware);
        assert_eq!(config.pretouch_chunk_size, MB);
    }

    #[test]
    fn test_invalid_workers() {
        let config = MapperConfig {
            pretouch_workers: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidWorkers(_))
        ));
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("1"));
        assert!(parse_flag("TRUE"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("yes"));
    }
}
