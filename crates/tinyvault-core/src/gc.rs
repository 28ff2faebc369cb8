//! Background garbage collection
//!
//! Each cycle:
//! 1. computes the watermark (oldest version a live snapshot can read)
//! 2. prunes versions hidden by retention or a discard marker that no
//!    snapshot at or above the watermark still reaches
//! 3. forgets keys left as a lone discarded tombstone
//! 4. writes a checkpoint, which also truncates the WAL
//!
//! The thread sleeps in short slices so shutdown never waits a full cycle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::engine::EngineInner;
use crate::error::{EngineError, EngineResult};

/// Counters across the engine's lifetime.
#[derive(Debug, Default)]
pub struct GcStats {
    cycles: AtomicU64,
    versions_pruned: AtomicU64,
    keys_dropped: AtomicU64,
    failures: AtomicU64,
}

impl GcStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn versions_pruned(&self) -> u64 {
        self.versions_pruned.load(Ordering::Relaxed)
    }

    pub fn keys_dropped(&self) -> u64 {
        self.keys_dropped.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn record(&self, report: &GcReport) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.versions_pruned.fetch_add(report.versions_pruned as u64, Ordering::Relaxed);
        self.keys_dropped.fetch_add(report.keys_dropped as u64, Ordering::Relaxed);
    }
}

/// Outcome of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcReport {
    pub watermark: u64,
    pub versions_pruned: usize,
    pub keys_dropped: usize,
    pub checkpoint_version: u64,
}

/// Run one GC cycle on the calling thread.
pub(crate) fn run_cycle(inner: &EngineInner) -> EngineResult<GcReport> {
    let watermark = inner.snapshots.watermark(&inner.committed);
    let keep = inner.config.versions_to_keep;

    let (versions_pruned, keys_dropped) = {
        let mut data = inner.data.write();
        let before = data.len();
        let mut pruned = 0;
        data.retain(|_, chain| {
            pruned += chain.prune(keep, watermark);
            !chain.is_dead(watermark)
        });
        (pruned, before - data.len())
    };

    let checkpoint = inner.checkpoint()?;
    let report = GcReport {
        watermark,
        versions_pruned,
        keys_dropped,
        checkpoint_version: checkpoint.version,
    };
    inner.gc_stats.record(&report);
    info!(
        watermark,
        versions_pruned,
        keys_dropped,
        checkpoint_version = checkpoint.version,
        "gc cycle finished"
    );
    Ok(report)
}

/// Handle to the running GC thread. Dropping it stops the thread.
pub struct GcHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl GcHandle {
    /// Request shutdown and wait for the thread to finish its current cycle.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GcHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn the GC thread.
pub(crate) fn start_gc(inner: Arc<EngineInner>, cadence: Duration) -> EngineResult<GcHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let thread = thread::Builder::new()
        .name("tinyvault-gc".to_string())
        .spawn(move || gc_loop(inner, cadence, shutdown_flag))
        .map_err(|e| EngineError::Io {
            path: None,
            kind: e.kind(),
            message: format!("failed to spawn gc thread: {}", e),
        })?;

    Ok(GcHandle { shutdown, thread: Some(thread) })
}

fn gc_loop(inner: Arc<EngineInner>, cadence: Duration, shutdown: Arc<AtomicBool>) {
    loop {
        let wake_time = Instant::now() + cadence;
        while Instant::now() < wake_time {
            if shutdown.load(Ordering::Acquire) {
                return;
            }
            thread::sleep(Duration::from_millis(100).min(cadence));
        }

        if shutdown.load(Ordering::Acquire) || inner.is_closed() {
            return;
        }

        if let Err(e) = run_cycle(&inner) {
            inner.gc_stats.failures.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "gc cycle failed");
        }
    }
}
