//! Error Module - Mapper Error Types
//!
//! Defines all error types used by the region-to-space mapper.
//!
//! # Error Categories
//!
//! ## Configuration Errors
//! - `Configuration` - Invalid mapper configuration
//! - `NotPowerOfTwo` - Page size or region granularity is not a power of two
//! - `GranularityMismatch` - Commit granularity does not fit the strategy
//!
//! ## Protocol Errors
//! - `InvariantViolated` - Commit of a committed region, uncommit of an
//!   uncommitted region, refcount underflow
//! - `RegionOutOfBounds` / `PageOutOfBounds` - Range outside the mapped space
//! - `ListenerAlreadySet` - Second listener registration
//!
//! ## Platform Errors
//! - `VirtualMemoryError` - OS commit/uncommit failed

use crate::config::ConfigError;
use thiserror::Error;

/// Main error type for all mapper operations
///
/// # Examples
///
/// ```rust
/// use regionmap::MapperError;
///
/// fn handle_error(err: MapperError) {
///     match err {
///         MapperError::InvariantViolated(msg) => {
///             eprintln!("caller bug: {}", msg);
///         }
///         err if err.is_fatal() => {
///             panic!("heap unusable: {}", err);
///         }
///         _ => {
///             eprintln!("Other error: {}", err);
///         }
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum MapperError {
    /// Configuration error
    ///
    /// **When returned:** `MapperConfig::validate` rejected a value
    ///
    /// **Recovery strategy:** Fix configuration, refuse to start
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Granularity is not a power of two
    ///
    /// **When returned:** Mapper or page storage construction
    ///
    /// **Recovery strategy:** Cannot recover - refuse to start
    #[error("{what} must be a power of two, got {value}")]
    NotPowerOfTwo { what: &'static str, value: usize },

    /// Region and commit granularity do not fit the selected strategy
    ///
    /// **When returned:** Strategy construction when the ratio is inverted or
    /// one granularity is not a multiple of the other
    #[error(
        "Region granularity {region_granularity} incompatible with commit granularity {commit_granularity}"
    )]
    GranularityMismatch {
        region_granularity: usize,
        commit_granularity: usize,
    },

    /// Internal consistency check failed
    ///
    /// **When returned:** Caller broke the commit/uncommit protocol
    ///
    /// **Recovery strategy:** Cannot recover - this is a bug in the caller
    ///
    /// **Example scenario:**
    /// ```ignore
    /// mapper.commit_regions(0, 1, None)?;
    /// mapper.commit_regions(0, 1, None)?; // region 0 already committed
    /// ```
    #[error("Invariant violated: {0}")]
    InvariantViolated(String),

    /// Region range outside the mapper
    #[error("Region range [{start}, {start}+{count}) out of bounds for {limit} regions")]
    RegionOutOfBounds {
        start: usize,
        count: usize,
        limit: usize,
    },

    /// Page range outside the committable part of the storage
    #[error("Page range [{start}, {start}+{count}) out of bounds for {limit} pages")]
    PageOutOfBounds {
        start: usize,
        count: usize,
        limit: usize,
    },

    /// Virtual memory error
    ///
    /// **When returned:** OS virtual memory API call failed
    ///
    /// **Recovery strategy:** None - running out of backing memory is fatal
    #[error("Virtual memory error: {0}")]
    VirtualMemoryError(String),

    /// Listener registered twice
    #[error("Commit listener already set")]
    ListenerAlreadySet,

    /// Internal error - indicates a bug in the mapper
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MapperError {
    /// Check if this error leaves the heap unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MapperError::Configuration(_)
                | MapperError::NotPowerOfTwo { .. }
                | MapperError::GranularityMismatch { .. }
                | MapperError::VirtualMemoryError(_)
                | MapperError::Internal(_)
        )
    }

    /// Check if this error indicates a bug in the code above the mapper
    pub fn is_bug(&self) -> bool {
        matches!(
            self,
            MapperError::InvariantViolated(_)
                | MapperError::RegionOutOfBounds { .. }
                | MapperError::PageOutOfBounds { .. }
                | MapperError::Internal(_)
        )
    }
}

impl From<ConfigError> for MapperError {
    fn from(err: ConfigError) -> Self {
        MapperError::Configuration(err.to_string())
    }
}

/// Result type alias for mapper operations
pub type Result<T> = std::result::Result<T, MapperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = MapperError::InvariantViolated("region 3 already committed".to_string());
        assert!(err.is_bug());
        assert!(!err.is_fatal());

        let err = MapperError::VirtualMemoryError("ENOMEM".to_string());
        assert!(err.is_fatal());
        assert!(!err.is_bug());

        let err = MapperError::NotPowerOfTwo {
            what: "page_size",
            value: 3000,
        };
        assert!(err.is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = MapperError::RegionOutOfBounds {
            start: 10,
            count: 4,
            limit: 12,
        };
        assert_eq!(
            err.to_string(),
            "Region range [10, 10+4) out of bounds for 12 regions"
        );
    }

    #[test]
    fn test_config_error_conversion() {
        let err: MapperError = ConfigError::InvalidChunkSize("zero".to_string()).into();
        assert!(matches!(err, MapperError::Configuration(_)));
    }
}
