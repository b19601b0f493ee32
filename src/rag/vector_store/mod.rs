//! Vector store abstraction.
//!
//! A [`VectorStore`] persists embeddings in per-tenant namespaces and
//! answers similarity queries. Namespaces are the tenant isolation
//! boundary: no operation ever crosses them, and querying a namespace
//! that has never been written returns an empty result, not an error.

pub mod qdrant;

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::VectorStoreError;
use crate::rag::embeddings::cosine_similarity;

pub use qdrant::QdrantStore;

// ---------------------------------------------------------------------------
// Records and matches
// ---------------------------------------------------------------------------

/// A stored vector with its payload.
///
/// `id` is deterministically derived from `(doc_id, chunk_index)` by the
/// pipeline, so re-ingesting the same document overwrites in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub metadata: HashMap<String, Value>,
}

/// One similarity-query hit, ordered by descending score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorMatch {
    pub id: String,
    /// Cosine similarity, roughly [-1, 1], higher is better.
    pub score: f32,
    pub metadata: HashMap<String, Value>,
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Namespace-scoped vector persistence.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or overwrite records by id. Creates the namespace lazily
    /// with the dimensionality observed in this call.
    async fn upsert(
        &self,
        namespace: &str,
        records: Vec<VectorRecord>,
    ) -> Result<(), VectorStoreError>;

    /// Nearest neighbors of `vector`, descending by score. An unknown
    /// namespace yields an empty list.
    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
        filter: Option<&HashMap<String, Value>>,
    ) -> Result<Vec<VectorMatch>, VectorStoreError>;

    /// Delete records by id. Nonexistent ids are a no-op.
    async fn delete(&self, namespace: &str, ids: &[String]) -> Result<(), VectorStoreError>;

    /// Remove the namespace and everything in it. Idempotent.
    async fn delete_namespace(&self, namespace: &str) -> Result<(), VectorStoreError>;

    /// Number of records in the namespace (0 when unknown).
    async fn count(&self, namespace: &str) -> Result<usize, VectorStoreError>;
}

// ---------------------------------------------------------------------------
// In-memory reference implementation
// ---------------------------------------------------------------------------

/// Brute-force in-memory store for tests and local development.
///
/// Linear-scan cosine similarity; not a performance substitute for a
/// real backend, but contract-identical to one.
#[derive(Default)]
pub struct InMemoryVectorStore {
    namespaces: RwLock<HashMap<String, Vec<VectorRecord>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(
        &self,
        namespace: &str,
        records: Vec<VectorRecord>,
    ) -> Result<(), VectorStoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut namespaces = self.namespaces.write();
        let existing = namespaces.entry(namespace.to_string()).or_default();
        let incoming: std::collections::HashSet<&str> =
            records.iter().map(|r| r.id.as_str()).collect();
        existing.retain(|r| !incoming.contains(r.id.as_str()));
        existing.extend(records);
        Ok(())
    }

    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
        filter: Option<&HashMap<String, Value>>,
    ) -> Result<Vec<VectorMatch>, VectorStoreError> {
        let namespaces = self.namespaces.read();
        let Some(records) = namespaces.get(namespace) else {
            return Ok(Vec::new());
        };

        let mut matches: Vec<VectorMatch> = records
            .iter()
            .filter(|record| match filter {
                Some(filter) => filter
                    .iter()
                    .all(|(key, value)| record.metadata.get(key) == Some(value)),
                None => true,
            })
            .map(|record| VectorMatch {
                id: record.id.clone(),
                score: cosine_similarity(vector, &record.embedding),
                metadata: record.metadata.clone(),
            })
            .collect();

        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn delete(&self, namespace: &str, ids: &[String]) -> Result<(), VectorStoreError> {
        let mut namespaces = self.namespaces.write();
        if let Some(records) = namespaces.get_mut(namespace) {
            let doomed: std::collections::HashSet<&str> =
                ids.iter().map(String::as_str).collect();
            records.retain(|r| !doomed.contains(r.id.as_str()));
        }
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), VectorStoreError> {
        self.namespaces.write().remove(namespace);
        Ok(())
    }

    async fn count(&self, namespace: &str) -> Result<usize, VectorStoreError> {
        Ok(self
            .namespaces
            .read()
            .get(namespace)
            .map(Vec::len)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, embedding: Vec<f32>, doc_id: &str) -> VectorRecord {
        let mut metadata = HashMap::new();
        metadata.insert("doc_id".to_string(), Value::String(doc_id.to_string()));
        VectorRecord {
            id: id.to_string(),
            embedding,
            metadata,
        }
    }

    #[tokio::test]
    async fn test_query_unknown_namespace_is_empty() {
        let store = InMemoryVectorStore::new();
        let matches = store.query("org_a", &[1.0, 0.0], 5, None).await.unwrap();
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn test_namespace_isolation() {
        let store = InMemoryVectorStore::new();
        store
            .upsert("org_b", vec![record("v1", vec![1.0, 0.0], "doc1")])
            .await
            .unwrap();

        // Populating org_b must not leak into org_a.
        let matches = store.query("org_a", &[1.0, 0.0], 5, None).await.unwrap();
        assert!(matches.is_empty());
        assert_eq!(store.count("org_a").await.unwrap(), 0);
        assert_eq!(store.count("org_b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_overwrites_by_id() {
        let store = InMemoryVectorStore::new();
        store
            .upsert("ns", vec![record("v1", vec![1.0, 0.0], "doc1")])
            .await
            .unwrap();
        store
            .upsert("ns", vec![record("v1", vec![0.0, 1.0], "doc1")])
            .await
            .unwrap();

        assert_eq!(store.count("ns").await.unwrap(), 1);
        let matches = store.query("ns", &[0.0, 1.0], 1, None).await.unwrap();
        assert!((matches[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_query_orders_by_descending_score() {
        let store = InMemoryVectorStore::new();
        store
            .upsert(
                "ns",
                vec![
                    record("far", vec![0.0, 1.0], "doc1"),
                    record("near", vec![1.0, 0.0], "doc1"),
                    record("mid", vec![1.0, 1.0], "doc1"),
                ],
            )
            .await
            .unwrap();

        let matches = store.query("ns", &[1.0, 0.0], 3, None).await.unwrap();
        assert_eq!(matches[0].id, "near");
        assert_eq!(matches[1].id, "mid");
        assert_eq!(matches[2].id, "far");
    }

    #[tokio::test]
    async fn test_metadata_filter() {
        let store = InMemoryVectorStore::new();
        store
            .upsert(
                "ns",
                vec![
                    record("a", vec![1.0, 0.0], "doc1"),
                    record("b", vec![1.0, 0.0], "doc2"),
                ],
            )
            .await
            .unwrap();

        let mut filter = HashMap::new();
        filter.insert("doc_id".to_string(), Value::String("doc2".to_string()));
        let matches = store.query("ns", &[1.0, 0.0], 10, Some(&filter)).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "b");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = InMemoryVectorStore::new();
        store
            .upsert("ns", vec![record("v1", vec![1.0], "doc1")])
            .await
            .unwrap();

        store.delete("ns", &["v1".to_string(), "ghost".to_string()]).await.unwrap();
        store.delete("ns", &["v1".to_string()]).await.unwrap();
        store.delete("absent", &["v1".to_string()]).await.unwrap();
        assert_eq!(store.count("ns").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_namespace_idempotent() {
        let store = InMemoryVectorStore::new();
        store
            .upsert("ns", vec![record("v1", vec![1.0], "doc1")])
            .await
            .unwrap();
        store.delete_namespace("ns").await.unwrap();
        store.delete_namespace("ns").await.unwrap();
        assert_eq!(store.count("ns").await.unwrap(), 0);
    }
}
