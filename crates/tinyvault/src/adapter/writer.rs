//! Index writes through the coordinator.

use std::sync::Arc;

use tinyvault_index::{BatchOp, IndexError, IndexResult, KvBatch, KvWriter, MergeOperator};
use tracing::trace;

use super::{store_err, StoreConfig};
use crate::transaction::{Operation, Transaction, WriteContext};

/// Turns index batches into coordinator transactions. Holds nothing but
/// handles, so closing it is a no-op.
pub struct EncryptedWriter {
    config: Arc<StoreConfig>,
    merge: Arc<dyn MergeOperator>,
}

impl EncryptedWriter {
    pub(crate) fn new(config: Arc<StoreConfig>, merge: Arc<dyn MergeOperator>) -> Self {
        Self { config, merge }
    }
}

impl KvWriter for EncryptedWriter {
    fn new_batch(&self) -> KvBatch {
        KvBatch::new(Arc::clone(&self.merge))
    }

    /// Merges are resolved against the latest committed values first, then
    /// the whole batch is submitted as one transaction. Index rows keep no
    /// history: every operation discards earlier versions of its key.
    fn execute_batch(&self, batch: KvBatch) -> IndexResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let (operator, ops, merges) = batch.into_parts();
        let mut tx = Transaction::new(WriteContext::with_timeout(self.config.transaction_timeout));

        if !merges.is_empty() {
            let txn = self.config.engine.read_txn().map_err(store_err)?;
            for (key, operands) in merges {
                let full = self.config.full_key(&key);
                let existing = match txn.get_value(&full).map_err(store_err)? {
                    Some(sealed) => {
                        Some(self.config.cipher.decrypt(&full, &sealed).map_err(store_err)?)
                    }
                    None => None,
                };
                let merged = operator
                    .full_merge(&key, existing.as_deref(), &operands)
                    .ok_or(IndexError::MergeFailed {
                        operator: operator.name(),
                        key_len: key.len(),
                    })?;
                tx.push(Operation::put(full, merged).with_clean_history());
            }
        }

        for op in ops {
            let operation = match op {
                BatchOp::Set { key, value } => Operation::put(self.config.full_key(&key), value),
                BatchOp::Delete { key } => Operation::delete(self.config.full_key(&key)),
            };
            tx.push(operation.with_clean_history());
        }

        let operations = tx.len();
        let version = self.config.writer.submit(tx).map_err(store_err)?;
        trace!(operations, version, "index batch committed");
        Ok(())
    }

    fn close(self) -> IndexResult<()> {
        Ok(())
    }
}
