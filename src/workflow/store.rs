//! Workflow Persistence Store
//!
//! Boundary to an external store that can seed the registry. Records are
//! plain JSON documents in the on-disk workflow format.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::BoxError;

/// An external source of workflow records.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Prepares the store (creates tables, directories, ...).
    async fn init(&self) -> Result<(), BoxError>;

    /// Lists every stored workflow record.
    async fn list_workflows(&self) -> Result<Vec<Value>, BoxError>;
}

/// In-memory store, keyed by the record's `intent` field.
#[derive(Debug, Default)]
pub struct MemoryWorkflowStore {
    records: RwLock<Vec<(String, Value)>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record by intent.
    pub async fn put(&self, record: Value) {
        let intent = record
            .get("intent")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut records = self.records.write().await;
        match records.iter_mut().find(|(key, _)| *key == intent) {
            Some(existing) => existing.1 = record,
            None => records.push((intent, record)),
        }
    }

    /// Deletes a record, returning true if it existed.
    pub async fn delete(&self, intent: &str) -> bool {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|(key, _)| key != intent);
        records.len() != before
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn init(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Records sorted case-insensitively by intent.
    async fn list_workflows(&self) -> Result<Vec<Value>, BoxError> {
        let records = self.records.read().await;
        let mut sorted: Vec<&(String, Value)> = records.iter().collect();
        sorted.sort_by_key(|(intent, _)| intent.to_lowercase());
        Ok(sorted.into_iter().map(|(_, record)| record.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_put_and_list() {
        let store = MemoryWorkflowStore::new();
        store.put(json!({"intent": "beta", "steps": []})).await;
        store.put(json!({"intent": "Alpha", "steps": []})).await;
        store.put(json!({"intent": "beta", "description": "updated", "steps": []})).await;

        let records = store.list_workflows().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["intent"], "Alpha");
        assert_eq!(records[1]["description"], "updated");
    }

    #[tokio::test]
    async fn test_memory_store_delete() {
        let store = MemoryWorkflowStore::new();
        store.put(json!({"intent": "gone"})).await;

        assert!(store.delete("gone").await);
        assert!(!store.delete("gone").await);
        assert!(store.list_workflows().await.unwrap().is_empty());
    }
}
