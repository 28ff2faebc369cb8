//! Database configuration
//!
//! Defaults suit a server-class machine. The engine configuration is derived
//! from these knobs, not set separately.

use std::time::Duration;

use tinyvault_core::EngineConfig;

#[derive(Debug, Clone)]
pub struct DbConfig {
    /// How long a write waits for its batch to commit
    pub transaction_timeout: Duration,
    /// Default timeout of index searches
    pub query_timeout: Duration,
    /// Operations merged into one engine commit at most
    pub write_batch_max_ops: usize,
    /// Payload bytes merged into one engine commit at most
    pub write_batch_max_bytes: usize,
    /// How long the writer keeps admitting queued transactions into a batch
    pub write_batch_window: Duration,
    /// Earlier versions reachable through history and rollback
    pub history_retention: usize,
    /// Background GC cadence; `Duration::ZERO` disables it
    pub gc_interval: Duration,
    /// Bytes per file chunk
    pub file_chunk_size: usize,
    /// Sync the WAL on every commit
    pub sync_writes: bool,
}

impl DbConfig {
    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn with_write_batch_limits(
        mut self,
        max_ops: usize,
        max_bytes: usize,
        window: Duration,
    ) -> Self {
        self.write_batch_max_ops = max_ops;
        self.write_batch_max_bytes = max_bytes;
        self.write_batch_window = window;
        self
    }

    pub fn with_history_retention(mut self, retention: usize) -> Self {
        self.history_retention = retention;
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn with_file_chunk_size(mut self, chunk_size: usize) -> Self {
        self.file_chunk_size = chunk_size;
        self
    }

    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.transaction_timeout.is_zero() {
            return Err("transaction_timeout must be > 0".into());
        }
        if self.query_timeout.is_zero() {
            return Err("query_timeout must be > 0".into());
        }
        if self.write_batch_max_ops == 0 {
            return Err("write_batch_max_ops must be > 0".into());
        }
        if self.write_batch_max_bytes == 0 {
            return Err("write_batch_max_bytes must be > 0".into());
        }
        if self.history_retention == 0 {
            return Err("history_retention must be > 0".into());
        }
        if self.file_chunk_size == 0 {
            return Err("file_chunk_size must be > 0".into());
        }
        self.engine_config().validate()
    }

    /// Engine settings for these knobs. The engine counts the current version
    /// in `versions_to_keep`, hence the `+ 1`.
    pub fn engine_config(&self) -> EngineConfig {
        let base = EngineConfig::server();
        EngineConfig {
            versions_to_keep: self.history_retention + 1,
            gc_interval: self.gc_interval,
            max_value_size: base.max_value_size.max(self.file_chunk_size + 4096),
            // A full admission batch plus the pending markers it may carry
            max_batch_ops: base.max_batch_ops.max(self.write_batch_max_ops * 2),
            sync_writes: self.sync_writes,
            ..base
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            transaction_timeout: Duration::from_secs(15),
            query_timeout: Duration::from_secs(30),
            write_batch_max_ops: 10_000,
            write_batch_max_bytes: 100 * 1024 * 1024,
            write_batch_window: Duration::from_millis(50),
            history_retention: 10,
            gc_interval: Duration::from_secs(12 * 60 * 60),
            file_chunk_size: 5_000_000,
            sync_writes: true,
        }
    }
}
