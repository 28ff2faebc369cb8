//! Transactions submitted to the write coordinator

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{DbError, DbResult};

/// One key-level mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub key: Vec<u8>,
    /// Cleartext payload; `None` deletes the key
    pub payload: Option<Vec<u8>>,
    /// Discard every earlier version of the key instead of appending one
    pub clean_history: bool,
    /// Set for file chunks; `Some(0)` is the metadata slot
    pub chunk_index: Option<u64>,
}

impl Operation {
    pub fn put(key: Vec<u8>, payload: Vec<u8>) -> Self {
        Self { key, payload: Some(payload), clean_history: false, chunk_index: None }
    }

    pub fn delete(key: Vec<u8>) -> Self {
        Self { key, payload: None, clean_history: false, chunk_index: None }
    }

    pub fn with_clean_history(mut self) -> Self {
        self.clean_history = true;
        self
    }

    pub fn for_chunk(mut self, index: u64) -> Self {
        self.chunk_index = Some(index);
        self
    }

    pub fn is_delete(&self) -> bool {
        self.payload.is_none()
    }

    pub fn is_file(&self) -> bool {
        self.chunk_index.is_some()
    }

    /// Key plus payload length; batch byte limits are measured in this.
    pub fn size(&self) -> usize {
        self.key.len() + self.payload.as_ref().map_or(0, Vec::len)
    }
}

/// Deadline plus a cancel flag shared with whoever may abandon the write.
#[derive(Debug, Clone)]
pub struct WriteContext {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl WriteContext {
    /// No deadline, never cancelled unless [`WriteContext::cancel`] is called.
    pub fn background() -> Self {
        Self { deadline: None, cancelled: Arc::new(AtomicBool::new(false)) }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { deadline: Some(Instant::now() + timeout), ..Self::background() }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel this context and every clone of it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// `Cancelled` or `Timeout` once the context is done.
    pub fn check(&self) -> DbResult<()> {
        if self.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(DbError::Timeout),
            _ => Ok(()),
        }
    }

    /// Time left before the deadline, capped at `max`.
    pub fn remaining(&self, max: Duration) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(max),
            None => max,
        }
    }
}

/// Operations that commit together, or not at all.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub(crate) operations: Vec<Operation>,
    pub(crate) context: WriteContext,
}

impl Transaction {
    pub fn new(context: WriteContext) -> Self {
        Self { operations: Vec::new(), context }
    }

    pub fn with_operations(context: WriteContext, operations: Vec<Operation>) -> Self {
        Self { operations, context }
    }

    pub fn push(&mut self, operation: Operation) -> &mut Self {
        self.operations.push(operation);
        self
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn context(&self) -> &WriteContext {
        &self.context
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn payload_bytes(&self) -> usize {
        self.operations.iter().map(Operation::size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_expiry_and_cancel() {
        let ctx = WriteContext::with_timeout(Duration::ZERO);
        assert!(matches!(ctx.check(), Err(DbError::Timeout)));

        let ctx = WriteContext::background();
        let clone = ctx.clone();
        assert!(ctx.check().is_ok());
        clone.cancel();
        assert!(matches!(ctx.check(), Err(DbError::Cancelled)));
    }

    #[test]
    fn test_operation_flags() {
        let op = Operation::put(b"k".to_vec(), b"vv".to_vec()).with_clean_history().for_chunk(3);
        assert!(op.clean_history && op.is_file() && !op.is_delete());
        assert_eq!(op.size(), 3);
        assert!(Operation::delete(b"k".to_vec()).is_delete());
    }

    #[test]
    fn test_remaining_is_capped() {
        let ctx = WriteContext::with_timeout(Duration::from_secs(60));
        assert_eq!(ctx.remaining(Duration::from_millis(5)), Duration::from_millis(5));
        let background = WriteContext::background();
        assert_eq!(background.remaining(Duration::from_secs(1)), Duration::from_secs(1));
    }
}
