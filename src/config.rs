// # Configuration Surface
//
// Runtime settings for the AIO core and the streaming reader. The outer
// database loads these from its configuration file; everything here is a
// plain struct with serde derives so that loading stays declarative.
//
// `io_combine_limit` is special: it is captured into the shared control
// block when the process group initializes, so that every backend agrees on
// the iovec window size for the lifetime of the segment even if the live
// setting is changed later.

use crate::common::TablespaceId;
use crate::error::{AioError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Selects the I/O method implementation.
///
/// Only synchronous execution exists today; the variant set anticipates
/// kernel completion interfaces without paying per-operation dispatch cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoMethodKind {
    /// Execute staged I/Os with plain syscalls at submission time
    Sync,
}

/// Per-tablespace overrides for I/O concurrency.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TablespaceIoConfig {
    /// Override for `effective_io_concurrency`
    pub io_concurrency: Option<usize>,

    /// Override for `maintenance_io_concurrency`
    pub maintenance_io_concurrency: Option<usize>,
}

/// Configuration for the AIO subsystem and streaming reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AioConfig {
    /// Which I/O method executes submitted batches
    pub io_method: IoMethodKind,

    /// Number of AIO handles owned by each backend
    pub io_max_concurrency: usize,

    /// Number of bounce buffers reserved per backend
    pub io_bounce_buffers: usize,

    /// Maximum gather/scatter segments per handle
    pub io_combine_limit: usize,

    /// Target number of concurrent I/Os for ordinary reads
    pub effective_io_concurrency: usize,

    /// Target number of concurrent I/Os for maintenance work
    pub maintenance_io_concurrency: usize,

    /// Physical read size for streaming reads, in blocks
    pub buffer_io_size: usize,

    /// Whether data files bypass the OS page cache
    pub io_direct_data: bool,

    /// Per-tablespace concurrency overrides
    pub tablespaces: HashMap<TablespaceId, TablespaceIoConfig>,
}

impl Default for AioConfig {
    fn default() -> Self {
        Self {
            io_method: IoMethodKind::Sync,
            io_max_concurrency: 32,
            io_bounce_buffers: 64,
            io_combine_limit: 16,
            effective_io_concurrency: 1,
            maintenance_io_concurrency: 10,
            buffer_io_size: 16,
            io_direct_data: false,
            tablespaces: HashMap::new(),
        }
    }
}

impl AioConfig {
    /// Validate settings before the shared control block is sized from them.
    pub fn validate(&self) -> Result<()> {
        if self.io_max_concurrency == 0 {
            return Err(AioError::Configuration(
                "io_max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.io_combine_limit == 0 {
            return Err(AioError::Configuration(
                "io_combine_limit must be at least 1".to_string(),
            ));
        }
        if self.buffer_io_size == 0 {
            return Err(AioError::Configuration(
                "buffer_io_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the I/O concurrency target for a tablespace, falling back to
    /// the global setting when no override exists.
    pub fn io_concurrency_for(&self, tablespace: TablespaceId, maintenance: bool) -> usize {
        let overrides = self.tablespaces.get(&tablespace);
        if maintenance {
            overrides
                .and_then(|o| o.maintenance_io_concurrency)
                .unwrap_or(self.maintenance_io_concurrency)
        } else {
            overrides
                .and_then(|o| o.io_concurrency)
                .unwrap_or(self.effective_io_concurrency)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AioConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.io_method, IoMethodKind::Sync);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = AioConfig {
            io_max_concurrency: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tablespace_override_fallback() {
        let mut config = AioConfig::default();
        config.tablespaces.insert(
            7,
            TablespaceIoConfig {
                io_concurrency: Some(4),
                maintenance_io_concurrency: None,
            },
        );

        assert_eq!(config.io_concurrency_for(7, false), 4);
        // No maintenance override: falls back to the global setting.
        assert_eq!(
            config.io_concurrency_for(7, true),
            config.maintenance_io_concurrency
        );
        // Unknown tablespace: global settings apply.
        assert_eq!(
            config.io_concurrency_for(99, false),
            config.effective_io_concurrency
        );
    }

    #[test]
    fn test_config_loads_from_json() {
        let loaded: AioConfig =
            serde_json::from_str(r#"{"io_method":"sync","io_max_concurrency":8}"#).unwrap();
        assert_eq!(loaded.io_max_concurrency, 8);
        assert_eq!(loaded.buffer_io_size, AioConfig::default().buffer_io_size);
    }
}
