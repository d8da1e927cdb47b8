//! In-Memory Store
//!
//! Durable-store adapter that keeps committed rows in memory. Used for
//! tests and for running the controller without a data directory.

use crate::domain::ports::{DurableStore, StoreRecord, TransactionId};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Rows staged by open transactions, keyed by row key
pub(crate) type StagedRows = BTreeMap<String, StoreRecord>;

/// In-memory durable store
pub struct MemoryStore {
    committed: RwLock<BTreeMap<String, StoreRecord>>,
    open: DashMap<TransactionId, StagedRows>,
    next_tx: AtomicU64,
    commit_count: AtomicU64,
    fail_next_commit: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            committed: RwLock::new(BTreeMap::new()),
            open: DashMap::new(),
            next_tx: AtomicU64::new(1),
            commit_count: AtomicU64::new(0),
            fail_next_commit: Mutex::new(None),
        }
    }

    /// Store pre-filled with committed rows
    pub fn with_records(records: impl IntoIterator<Item = StoreRecord>) -> Self {
        let store = Self::new();
        {
            let mut committed = store.committed.write();
            for record in records {
                committed.insert(record.key(), record);
            }
        }
        store
    }

    /// Make the next commit fail with the given reason
    pub fn fail_next_commit(&self, reason: impl Into<String>) {
        *self.fail_next_commit.lock() = Some(reason.into());
    }

    pub fn open_transactions(&self) -> usize {
        self.open.len()
    }

    pub fn commit_count(&self) -> u64 {
        self.commit_count.load(Ordering::Relaxed)
    }

    pub fn committed_len(&self) -> usize {
        self.committed.read().len()
    }

    pub(crate) fn take_staged(&self, tx: TransactionId) -> Result<StagedRows> {
        self.open
            .remove(&tx)
            .map(|(_, rows)| rows)
            .ok_or(Error::UnknownTransaction { tx_id: tx.0 })
    }

    pub(crate) fn take_injected_failure(&self) -> Option<String> {
        self.fail_next_commit.lock().take()
    }

    /// Merge rows into the committed set
    pub(crate) fn merge(&self, rows: StagedRows) {
        self.committed.write().extend(rows);
        self.commit_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Vec<StoreRecord> {
        self.committed.read().values().cloned().collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn begin_transaction(&self) -> Result<TransactionId> {
        let tx = TransactionId(self.next_tx.fetch_add(1, Ordering::Relaxed));
        self.open.insert(tx, StagedRows::new());
        Ok(tx)
    }

    async fn stage_write(&self, tx: TransactionId, record: StoreRecord) -> Result<()> {
        let mut rows = self
            .open
            .get_mut(&tx)
            .ok_or(Error::UnknownTransaction { tx_id: tx.0 })?;
        rows.insert(record.key(), record);
        Ok(())
    }

    async fn commit(&self, tx: TransactionId) -> Result<()> {
        let rows = self.take_staged(tx)?;
        if let Some(reason) = self.take_injected_failure() {
            // keep the rows staged so the caller can still roll back
            self.open.insert(tx, rows);
            return Err(Error::Store {
                backend: self.backend_name().to_string(),
                reason,
            });
        }
        self.merge(rows);
        Ok(())
    }

    async fn rollback(&self, tx: TransactionId) -> Result<()> {
        self.take_staged(tx).map(|_| ())
    }

    async fn load_all(&self) -> Result<Vec<StoreRecord>> {
        Ok(self.snapshot())
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Node, NodeName};
    use assert_matches::assert_matches;

    fn node(name: &str) -> StoreRecord {
        StoreRecord::Node(Node::new(NodeName::new(name).unwrap()))
    }

    #[tokio::test]
    async fn test_staged_rows_invisible_until_commit() {
        let store = MemoryStore::new();
        let tx = store.begin_transaction().await.unwrap();
        store.stage_write(tx, node("node-a")).await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());

        store.commit(tx).await.unwrap();
        assert_eq!(store.load_all().await.unwrap().len(), 1);
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_transaction() {
        let store = MemoryStore::new();
        assert_matches!(
            store.stage_write(TransactionId(99), node("node-a")).await,
            Err(Error::UnknownTransaction { tx_id: 99 })
        );
        let tx = store.begin_transaction().await.unwrap();
        store.rollback(tx).await.unwrap();
        assert_matches!(store.commit(tx).await, Err(Error::UnknownTransaction { .. }));
    }

    #[tokio::test]
    async fn test_injected_commit_failure() {
        let store = MemoryStore::new();
        let tx = store.begin_transaction().await.unwrap();
        store.stage_write(tx, node("node-a")).await.unwrap();
        store.fail_next_commit("disk full");

        assert_matches!(store.commit(tx).await, Err(Error::Store { .. }));
        assert_eq!(store.open_transactions(), 1);
        store.rollback(tx).await.unwrap();
        assert_eq!(store.committed_len(), 0);
    }
}
