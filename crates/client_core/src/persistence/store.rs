use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use storage::Storage;
use tokio::sync::Mutex;

/// One keyed, versioned document as it sits in the local store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub body: Value,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load_document(&self, key: &str) -> Result<Option<StoredDocument>>;
    async fn save_document(&self, key: &str, document: &StoredDocument) -> Result<()>;
    async fn delete_document(&self, key: &str) -> Result<bool>;
}

#[async_trait]
impl SnapshotStore for Storage {
    async fn load_document(&self, key: &str) -> Result<Option<StoredDocument>> {
        let Some(record) = Storage::load_document(self, key).await? else {
            return Ok(None);
        };
        let body = serde_json::from_str(&record.body)
            .with_context(|| format!("stored document '{key}' is not valid json"))?;
        let raw_version = record.version;
        let version = u32::try_from(raw_version)
            .with_context(|| format!("stored document '{key}' has bad version {raw_version}"))?;
        Ok(Some(StoredDocument {
            version,
            saved_at: record.saved_at,
            body,
        }))
    }

    async fn save_document(&self, key: &str, document: &StoredDocument) -> Result<()> {
        let body = serde_json::to_string(&document.body)
            .with_context(|| format!("failed to encode document '{key}'"))?;
        Storage::save_document(
            self,
            key,
            i64::from(document.version),
            document.saved_at,
            &body,
        )
        .await
    }

    async fn delete_document(&self, key: &str) -> Result<bool> {
        Storage::delete_document(self, key).await
    }
}

#[derive(Default)]
struct MemoryDocuments {
    documents: BTreeMap<String, StoredDocument>,
    save_counts: BTreeMap<String, usize>,
    fail_saves: bool,
}

/// Volatile store for tests and throwaway sessions.
#[derive(Default)]
pub struct MemorySnapshotStore {
    inner: Mutex<MemoryDocuments>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn save_count(&self, key: &str) -> usize {
        self.inner
            .lock()
            .await
            .save_counts
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    pub async fn set_fail_saves(&self, fail: bool) {
        self.inner.lock().await.fail_saves = fail;
    }

    pub async fn document(&self, key: &str) -> Option<StoredDocument> {
        self.inner.lock().await.documents.get(key).cloned()
    }

    pub async fn insert(&self, key: &str, document: StoredDocument) {
        self.inner
            .lock()
            .await
            .documents
            .insert(key.to_string(), document);
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load_document(&self, key: &str) -> Result<Option<StoredDocument>> {
        Ok(self.inner.lock().await.documents.get(key).cloned())
    }

    async fn save_document(&self, key: &str, document: &StoredDocument) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.fail_saves {
            anyhow::bail!("document store is read-only");
        }
        inner.documents.insert(key.to_string(), document.clone());
        *inner.save_counts.entry(key.to_string()).or_default() += 1;
        Ok(())
    }

    async fn delete_document(&self, key: &str) -> Result<bool> {
        Ok(self.inner.lock().await.documents.remove(key).is_some())
    }
}
