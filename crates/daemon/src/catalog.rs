//! Stream catalog: where finished transcodes are recorded.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::protocol::{now_ms, TaskResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub reference: String,
    pub source_url: String,
    pub result: TaskResult,
    pub added_at: i64,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn lookup(&self, reference: &str) -> Result<Option<StreamEntry>, CatalogError>;

    /// Record a finished stream. Adding an existing reference replaces it.
    async fn add_stream(
        &self,
        reference: &str,
        source_url: &str,
        result: &TaskResult,
    ) -> Result<StreamEntry, CatalogError>;
}

#[derive(Debug, Default)]
pub struct MemoryCatalog {
    streams: RwLock<HashMap<String, StreamEntry>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn lookup(&self, reference: &str) -> Result<Option<StreamEntry>, CatalogError> {
        Ok(self.streams.read().get(reference).cloned())
    }

    async fn add_stream(
        &self,
        reference: &str,
        source_url: &str,
        result: &TaskResult,
    ) -> Result<StreamEntry, CatalogError> {
        let entry = StreamEntry {
            reference: reference.to_string(),
            source_url: source_url.to_string(),
            result: result.clone(),
            added_at: now_ms(),
        };
        self.streams
            .write()
            .insert(reference.to_string(), entry.clone());
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_then_lookup() {
        let catalog = MemoryCatalog::new();
        assert!(catalog.lookup("abc").await.unwrap().is_none());

        let result = TaskResult {
            url: "s3://bucket/abc".to_string(),
            size_bytes: 10,
        };
        catalog
            .add_stream("abc", "https://cdn.example/abc", &result)
            .await
            .unwrap();

        let entry = catalog.lookup("abc").await.unwrap().unwrap();
        assert_eq!(entry.result.url, "s3://bucket/abc");
        assert_eq!(catalog.len(), 1);
    }
}
