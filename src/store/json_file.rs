//! JSON File Store
//!
//! Durable-store adapter persisting all committed rows as one JSON
//! document. A commit writes the merged document to a temporary file,
//! syncs it, renames it over the old one and syncs the directory, so
//! readers see either the old or the new state and a returned commit
//! survives a crash.

use super::memory::MemoryStore;
use crate::domain::ports::{DurableStore, StoreRecord, TransactionId};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Name of the database file inside the data directory
pub const DATABASE_FILE: &str = "controller-db.json";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    version: u32,
    written_at: DateTime<Utc>,
    records: Vec<StoreRecord>,
}

const DOCUMENT_VERSION: u32 = 1;

/// File-backed durable store
pub struct JsonFileStore {
    path: PathBuf,
    rows: MemoryStore,
    // serializes commits so the file always matches the merged row set
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open or create the database in a data directory
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir).await?;
        let path = data_dir.join(DATABASE_FILE);

        let records = match fs::read_to_string(&path).await {
            Ok(json) => {
                let doc: Document = serde_json::from_str(&json)?;
                if doc.version != DOCUMENT_VERSION {
                    return Err(Error::Store {
                        backend: "json-file".into(),
                        reason: format!("unsupported document version {}", doc.version),
                    });
                }
                doc.records
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        info!(path = %path.display(), rows = records.len(), "Opened JSON store");
        Ok(Self {
            path,
            rows: MemoryStore::with_records(records),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Make the next commit fail with the given reason
    pub fn fail_next_commit(&self, reason: impl Into<String>) {
        self.rows.fail_next_commit(reason);
    }

    async fn write_document(&self, records: Vec<StoreRecord>) -> Result<()> {
        let doc = Document {
            version: DOCUMENT_VERSION,
            written_at: Utc::now(),
            records,
        };
        let json = serde_json::to_vec_pretty(&doc)?;

        let tmp = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &self.path).await?;
        self.sync_dir().await?;
        debug!(path = %self.path.display(), bytes = json.len(), "Wrote store document");
        Ok(())
    }

    /// Persist the rename itself
    #[cfg(unix)]
    async fn sync_dir(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::File::open(dir).await?.sync_all().await?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn sync_dir(&self) -> Result<()> {
        Ok(())
    }

    fn store_error(&self, err: Error) -> Error {
        match err {
            e @ (Error::Store { .. } | Error::UnknownTransaction { .. }) => e,
            other => Error::Store {
                backend: self.backend_name().to_string(),
                reason: other.to_string(),
            },
        }
    }
}

#[async_trait]
impl DurableStore for JsonFileStore {
    async fn begin_transaction(&self) -> Result<TransactionId> {
        self.rows.begin_transaction().await
    }

    async fn stage_write(&self, tx: TransactionId, record: StoreRecord) -> Result<()> {
        self.rows.stage_write(tx, record).await
    }

    async fn commit(&self, tx: TransactionId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let staged = self.rows.take_staged(tx)?;

        if let Some(reason) = self.rows.take_injected_failure() {
            return Err(Error::Store {
                backend: self.backend_name().to_string(),
                reason,
            });
        }

        let mut merged: BTreeMap<String, StoreRecord> = self
            .rows
            .snapshot()
            .into_iter()
            .map(|r| (r.key(), r))
            .collect();
        merged.extend(staged.clone());

        self.write_document(merged.into_values().collect())
            .await
            .map_err(|e| self.store_error(e))?;
        self.rows.merge(staged);
        Ok(())
    }

    async fn rollback(&self, tx: TransactionId) -> Result<()> {
        match self.rows.rollback(tx).await {
            // the transaction already ended with a failed commit
            Err(Error::UnknownTransaction { .. }) => Ok(()),
            other => other,
        }
    }

    async fn load_all(&self) -> Result<Vec<StoreRecord>> {
        self.rows.load_all().await
    }

    fn backend_name(&self) -> &str {
        "json-file"
    }
}
