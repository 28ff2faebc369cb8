//! Write coordinator
//!
//! Every mutation in the database goes through one thread. Callers submit a
//! [`Transaction`] on a bounded queue and wait on their own response channel.
//! The writer thread:
//!
//! 1. blocks for one transaction
//! 2. keeps pulling queued transactions without blocking until the batch hits
//!    its operation limit, its byte limit or its admission window, or the
//!    queue runs dry
//! 3. encrypts every payload under its target key and commits the whole batch
//!    as one engine commit, one version group per transaction
//! 4. sends the outcome to every participant with a non-blocking send
//!
//! A failed encryption or commit fails every transaction of the batch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tinyvault_core::{Cipher, Engine, EngineError, EngineResult, WriteBatch};
use tracing::{debug, info, warn};

use crate::error::{DbError, DbResult};
use crate::transaction::Transaction;

/// Poll interval of waiting submitters and of the idle writer thread.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Back-off between attempts to enqueue on a full queue.
const ENQUEUE_BACKOFF: Duration = Duration::from_millis(1);

/// When the writer stops admitting transactions into a batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub max_ops: usize,
    pub max_bytes: usize,
    pub window: Duration,
}

/// Counters across the coordinator's lifetime.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    batches: AtomicU64,
    transactions: AtomicU64,
    operations: AtomicU64,
    failed_batches: AtomicU64,
}

impl CoordinatorStats {
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn transactions(&self) -> u64 {
        self.transactions.load(Ordering::Relaxed)
    }

    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    pub fn failed_batches(&self) -> u64 {
        self.failed_batches.load(Ordering::Relaxed)
    }
}

/// Engine outcome handed to each participant; `EngineError` is `Clone` so
/// every participant gets the same error.
type Response = EngineResult<u64>;

struct Pending {
    tx: Transaction,
    respond: SyncSender<Response>,
}

/// Cloneable submit handle.
#[derive(Clone)]
pub struct CoordinatorHandle {
    queue: SyncSender<Pending>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<CoordinatorStats>,
}

impl CoordinatorHandle {
    /// Submit `tx` and wait for its batch to commit. Returns the version the
    /// transaction's operations were committed at.
    pub fn submit(&self, tx: Transaction) -> DbResult<u64> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(DbError::Closed);
        }
        let ctx = tx.context.clone();
        ctx.check()?;

        let (respond, response) = mpsc::sync_channel(1);
        let mut pending = Pending { tx, respond };
        loop {
            match self.queue.try_send(pending) {
                Ok(()) => break,
                Err(TrySendError::Full(back)) => {
                    ctx.check()?;
                    if self.shutdown.load(Ordering::Acquire) {
                        return Err(DbError::Closed);
                    }
                    pending = back;
                    thread::sleep(ENQUEUE_BACKOFF);
                }
                Err(TrySendError::Disconnected(_)) => return Err(DbError::Closed),
            }
        }

        loop {
            match response.recv_timeout(ctx.remaining(POLL_INTERVAL)) {
                Ok(result) => return result.map_err(DbError::from),
                Err(RecvTimeoutError::Timeout) => ctx.check()?,
                Err(RecvTimeoutError::Disconnected) => return Err(DbError::Closed),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }
}

impl std::fmt::Debug for CoordinatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorHandle")
            .field("closed", &self.is_closed())
            .field("batches", &self.stats.batches())
            .finish()
    }
}

/// Owns the writer thread. Dropping it shuts the thread down.
pub struct WriteCoordinator {
    handle: CoordinatorHandle,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl WriteCoordinator {
    pub fn start(engine: Arc<Engine>, cipher: Cipher, limits: BatchLimits) -> DbResult<Self> {
        let capacity = limits.max_ops.saturating_mul(2).max(1);
        let (queue, receiver) = mpsc::sync_channel(capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(CoordinatorStats::default());

        let writer = Writer {
            engine,
            cipher,
            limits,
            queue: receiver,
            shutdown: Arc::clone(&shutdown),
            stats: Arc::clone(&stats),
        };
        let thread = thread::Builder::new()
            .name("tinyvault-writer".to_string())
            .spawn(move || writer.run())?;

        info!(
            queue_capacity = capacity,
            max_ops = limits.max_ops,
            max_bytes = limits.max_bytes,
            "write coordinator started"
        );
        Ok(Self {
            handle: CoordinatorHandle { queue, shutdown, stats },
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    pub fn submit(&self, tx: Transaction) -> DbResult<u64> {
        self.handle.submit(tx)
    }

    /// Stop the writer after its current batch. Queued transactions fail
    /// with `Closed`.
    pub fn shutdown(&self) {
        self.handle.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                warn!("writer thread panicked");
            }
        }
    }
}

impl Drop for WriteCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Writer {
    engine: Arc<Engine>,
    cipher: Cipher,
    limits: BatchLimits,
    queue: Receiver<Pending>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<CoordinatorStats>,
}

impl Writer {
    fn run(self) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let first = match self.queue.recv_timeout(POLL_INTERVAL) {
                Ok(pending) => pending,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let batch = self.collect(first);
            if !batch.is_empty() {
                self.commit(batch);
            }
        }

        let mut refused = 0usize;
        while let Ok(pending) = self.queue.try_recv() {
            let _ = pending.respond.try_send(Err(EngineError::Closed));
            refused += 1;
        }
        debug!(refused, "writer thread stopped");
    }

    /// Admit `first` and whatever else is queued, within the batch limits.
    fn collect(&self, first: Pending) -> Vec<Pending> {
        let opened = Instant::now();
        let mut batch = Vec::new();
        let mut ops = 0usize;
        let mut bytes = 0usize;

        let mut next = Some(first);
        while let Some(pending) = next.take() {
            // A caller that already gave up was told its write failed
            if let Err(e) = pending.tx.context.check() {
                debug!(error = %e, "dropping expired transaction");
            } else {
                ops += pending.tx.len();
                bytes += pending.tx.payload_bytes();
                batch.push(pending);
            }

            if ops >= self.limits.max_ops
                || bytes >= self.limits.max_bytes
                || opened.elapsed() >= self.limits.window
            {
                break;
            }
            next = match self.queue.try_recv() {
                Ok(pending) => Some(pending),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
            };
        }
        batch
    }

    fn commit(&self, batch: Vec<Pending>) {
        let operations: usize = batch.iter().map(|p| p.tx.len()).sum();
        let bytes: usize = batch.iter().map(|p| p.tx.payload_bytes()).sum();

        let result = self.build(&batch).and_then(|write_batch| self.engine.commit(write_batch));

        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        self.stats.transactions.fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.stats.operations.fetch_add(operations as u64, Ordering::Relaxed);
        match &result {
            Ok(info) => debug!(
                transactions = batch.len(),
                operations,
                bytes,
                first_version = info.first_version,
                last_version = info.last_version,
                "batch committed"
            ),
            Err(e) => {
                self.stats.failed_batches.fetch_add(1, Ordering::Relaxed);
                warn!(transactions = batch.len(), operations, error = %e, "batch failed");
            }
        }

        for (index, pending) in batch.into_iter().enumerate() {
            let response =
                result.as_ref().map(|info| info.group_version(index)).map_err(|e| e.clone());
            // Receivers that gave up are gone; nobody else waits on this channel
            let _ = pending.respond.try_send(response);
        }
    }

    /// One version group per transaction, every payload sealed under its key.
    fn build(&self, batch: &[Pending]) -> EngineResult<WriteBatch> {
        let mut write_batch = WriteBatch::new();
        for (index, pending) in batch.iter().enumerate() {
            if index > 0 {
                write_batch.new_group();
            }
            for op in &pending.tx.operations {
                match (&op.payload, op.clean_history) {
                    (Some(plain), false) => {
                        write_batch.set(op.key.clone(), self.cipher.encrypt(&op.key, plain)?);
                    }
                    (Some(plain), true) => {
                        let sealed = self.cipher.encrypt(&op.key, plain)?;
                        write_batch.set_discard(op.key.clone(), sealed);
                    }
                    (None, false) => {
                        write_batch.delete(op.key.clone());
                    }
                    (None, true) => {
                        write_batch.delete_discard(op.key.clone());
                    }
                }
            }
        }
        Ok(write_batch)
    }
}
