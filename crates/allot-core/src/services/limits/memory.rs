//! In-process document store
//!
//! Same optimistic contract as the SQLite adapter, backed by a versioned map.
//! Useful for tests and for embedding the engine without a database.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::document::LimitsDocument;
use super::store::{DocumentStore, DocumentTransaction};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Versioned {
    version: u64,
    doc: LimitsDocument,
}

type Documents = Arc<RwLock<HashMap<String, Versioned>>>;

/// Versioned in-memory document map
#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentStore {
    docs: Documents,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version of a user's document, `None` if absent
    pub async fn version(&self, user_id: &str) -> Option<u64> {
        self.docs.read().await.get(user_id).map(|v| v.version)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, user_id: &str) -> Result<Option<LimitsDocument>> {
        Ok(self.docs.read().await.get(user_id).map(|v| v.doc.clone()))
    }

    async fn begin(&self, user_id: &str) -> Result<Box<dyn DocumentTransaction>> {
        let snapshot = self.docs.read().await.get(user_id).cloned();
        Ok(Box::new(MemoryTransaction {
            docs: Arc::clone(&self.docs),
            user_id: user_id.to_string(),
            version: snapshot.as_ref().map(|v| v.version),
            document: snapshot.map(|v| v.doc),
            staged: None,
        }))
    }

    async fn list(&self) -> Result<Vec<LimitsDocument>> {
        let docs = self.docs.read().await;
        let mut all: Vec<LimitsDocument> = docs.values().map(|v| v.doc.clone()).collect();
        all.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(all)
    }

    async fn delete(&self, user_id: &str) -> Result<bool> {
        Ok(self.docs.write().await.remove(user_id).is_some())
    }
}

struct MemoryTransaction {
    docs: Documents,
    user_id: String,
    document: Option<LimitsDocument>,
    version: Option<u64>,
    staged: Option<LimitsDocument>,
}

#[async_trait]
impl DocumentTransaction for MemoryTransaction {
    fn document(&self) -> Option<&LimitsDocument> {
        self.document.as_ref()
    }

    fn set(&mut self, doc: LimitsDocument) {
        self.staged = Some(doc);
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction {
            docs,
            user_id,
            version,
            staged,
            ..
        } = *self;
        let Some(doc) = staged else {
            return Ok(());
        };

        let mut docs = docs.write().await;
        let current = docs.get(&user_id).map(|v| v.version);
        if current != version {
            return Err(Error::Conflict(user_id));
        }

        let next = current.map_or(1, |v| v + 1);
        docs.insert(user_id, Versioned { version: next, doc });
        Ok(())
    }
}
