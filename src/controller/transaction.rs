//! Transaction Context
//!
//! Unit of work of one mutation request. Rows are staged in the durable
//! store and minor numbers are reserved in the pool; commit makes both
//! permanent and applies the rows to the cluster model, rollback (or
//! dropping an open transaction) undoes both.

use crate::domain::ports::{DurableStoreRef, StoreRecord, TransactionId};
use crate::controller::number_pool::MinorNumberPoolRef;
use crate::error::{Error, Result};
use crate::model::{ClusterModel, MinorNumber};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// Open unit of work
pub struct TransactionContext {
    store: DurableStoreRef,
    minor_pool: MinorNumberPoolRef,
    tx: TransactionId,
    staged: Vec<StoreRecord>,
    reserved_minors: Vec<MinorNumber>,
    state: TransactionState,
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("tx", &self.tx)
            .field("backend", &self.store.backend_name())
            .field("staged", &self.staged.len())
            .field("reserved_minors", &self.reserved_minors)
            .field("state", &self.state)
            .finish()
    }
}

impl TransactionContext {
    pub async fn begin(store: DurableStoreRef, minor_pool: MinorNumberPoolRef) -> Result<Self> {
        let tx = store.begin_transaction().await?;
        debug!(tx = %tx, backend = store.backend_name(), "Transaction started");
        Ok(Self {
            store,
            minor_pool,
            tx,
            staged: Vec::new(),
            reserved_minors: Vec::new(),
            state: TransactionState::Active,
        })
    }

    pub fn id(&self) -> TransactionId {
        self.tx
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Rows staged so far, in staging order
    pub fn staged(&self) -> &[StoreRecord] {
        &self.staged
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(Error::Internal(format!(
                "transaction {} is no longer active ({:?})",
                self.tx, self.state
            )));
        }
        Ok(())
    }

    /// Stage a row write
    pub async fn stage(&mut self, record: StoreRecord) -> Result<()> {
        self.ensure_active()?;
        self.store.stage_write(self.tx, record.clone()).await?;
        self.staged.push(record);
        Ok(())
    }

    /// Reserve a minor number for the lifetime of this transaction
    pub fn reserve_minor(&mut self, requested: Option<u32>) -> Result<MinorNumber> {
        self.ensure_active()?;
        let nr = self.minor_pool.reserve(requested)?;
        self.reserved_minors.push(nr);
        Ok(nr)
    }

    fn release_minors(&mut self) {
        for nr in self.reserved_minors.drain(..) {
            self.minor_pool.release(nr);
        }
    }

    /// Make staged rows durable and apply them to the model
    pub async fn commit(mut self, model: &ClusterModel) -> Result<Vec<StoreRecord>> {
        self.ensure_active()?;

        if let Err(err) = self.store.commit(self.tx).await {
            warn!(tx = %self.tx, error = %err, "Commit failed, rolling back");
            self.abort().await;
            return Err(err);
        }

        let staged = std::mem::take(&mut self.staged);
        // numbers now belong to committed volume definitions
        self.reserved_minors.clear();
        self.state = TransactionState::Committed;

        model.apply(&staged).map_err(|e| {
            Error::Internal(format!(
                "transaction {} committed but could not be applied: {}",
                self.tx, e
            ))
        })?;
        debug!(tx = %self.tx, rows = staged.len(), "Transaction committed");
        Ok(staged)
    }

    /// Discard staged rows and give reserved numbers back
    pub async fn rollback(mut self) -> Result<()> {
        self.ensure_active()?;
        self.release_minors();
        self.staged.clear();
        self.state = TransactionState::RolledBack;
        self.store.rollback(self.tx).await?;
        debug!(tx = %self.tx, "Transaction rolled back");
        Ok(())
    }

    async fn abort(&mut self) {
        self.release_minors();
        self.staged.clear();
        self.state = TransactionState::RolledBack;
        if let Err(err) = self.store.rollback(self.tx).await {
            warn!(tx = %self.tx, error = %err, "Rollback after failed commit failed");
        }
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        if self.state != TransactionState::Active {
            return;
        }
        self.release_minors();
        self.state = TransactionState::RolledBack;

        let store = self.store.clone();
        let tx = self.tx;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = store.rollback(tx).await {
                        warn!(tx = %tx, error = %err, "Rollback of dropped transaction failed");
                    }
                });
            }
            Err(_) => warn!(tx = %tx, "Dropped open transaction outside a runtime"),
        }
    }
}
