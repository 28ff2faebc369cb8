//! Engine configuration
//!
//! Hardware-tier presets plus `validate()`. The database layer builds an
//! [`EngineConfig`] from its own knobs; standalone users pick a preset and
//! adjust fields directly.

use std::time::Duration;

/// Hard ceiling for keys: the on-disk formats store key length as `u16`.
pub const KEY_SIZE_CEILING: usize = u16::MAX as usize;

/// Hard ceiling for values (128MB).
pub const VALUE_SIZE_CEILING: usize = 128 * 1024 * 1024;

/// Engine configuration with hardware tier presets
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Versions exposed per key by all-versions iteration, and kept by GC
    /// unless a live snapshot still needs an older one. Counts the newest.
    pub versions_to_keep: usize,
    /// Background GC + checkpoint cadence. `Duration::ZERO` disables the thread.
    pub gc_interval: Duration,
    /// WAL segment rotation threshold (bytes)
    pub wal_rotation_size_bytes: u64,
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Maximum value size in bytes
    pub max_value_size: usize,
    /// Maximum number of mutations accepted by one commit
    pub max_batch_ops: usize,
    /// `durable_sync` the WAL after every commit
    pub sync_writes: bool,
}

impl EngineConfig {
    /// Server-class machine: long GC cadence, large WAL segments
    pub fn server() -> Self {
        Self {
            versions_to_keep: 11,
            gc_interval: Duration::from_secs(12 * 60 * 60),
            wal_rotation_size_bytes: 100 * 1024 * 1024,
            max_key_size: 1024,
            max_value_size: 64 * 1024 * 1024,
            max_batch_ops: 100_000,
            sync_writes: true,
        }
    }

    /// Phone-class device
    pub fn phone() -> Self {
        Self {
            versions_to_keep: 6,
            gc_interval: Duration::from_secs(60 * 60),
            wal_rotation_size_bytes: 50 * 1024 * 1024,
            max_key_size: 512,
            max_value_size: 16 * 1024 * 1024,
            max_batch_ops: 20_000,
            sync_writes: true,
        }
    }

    /// Budget-class device: short cadence keeps the RAM footprint down
    pub fn budget() -> Self {
        Self {
            versions_to_keep: 3,
            gc_interval: Duration::from_secs(15 * 60),
            wal_rotation_size_bytes: 25 * 1024 * 1024,
            max_key_size: 256,
            max_value_size: 8 * 1024 * 1024,
            max_batch_ops: 5_000,
            sync_writes: true,
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.versions_to_keep == 0 {
            return Err("versions_to_keep must be > 0".into());
        }
        if self.wal_rotation_size_bytes < 1024 * 1024 {
            return Err("wal_rotation_size_bytes must be >= 1MB".into());
        }
        if self.max_key_size == 0 || self.max_key_size > KEY_SIZE_CEILING {
            return Err(format!("max_key_size must be in [1, {}]", KEY_SIZE_CEILING));
        }
        if self.max_value_size == 0 || self.max_value_size > VALUE_SIZE_CEILING {
            return Err("max_value_size must be in [1, 128MB]".into());
        }
        if self.max_batch_ops == 0 {
            return Err("max_batch_ops must be > 0".into());
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self { Self::server() }
}
