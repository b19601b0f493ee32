//! Qdrant vector store backend.
//!
//! Talks to the Qdrant REST API via `reqwest`. Collections are created
//! lazily on first upsert with the dimensionality observed in that call,
//! cosine distance, and payload indexes on the fields the pipeline
//! filters by. A missing collection on query or delete is treated as an
//! empty namespace, matching the in-memory reference implementation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::QdrantConfig;
use crate::error::VectorStoreError;

use super::{VectorMatch, VectorRecord, VectorStore};

pub struct QdrantStore {
    config: QdrantConfig,
    client: reqwest::Client,
}

impl QdrantStore {
    pub fn new(config: QdrantConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn collection_name(&self, namespace: &str) -> String {
        format!("{}{}", self.config.collection_prefix, namespace)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .request(method, format!("{}{}", self.config.url, path));
        if let Some(key) = &self.config.api_key {
            request = request.header("api-key", key);
        }
        request
    }

    async fn ensure_collection(
        &self,
        collection: &str,
        vector_size: usize,
    ) -> Result<(), VectorStoreError> {
        let status = self
            .request(reqwest::Method::GET, &format!("/collections/{collection}"))
            .send()
            .await?
            .status();
        if status.is_success() {
            return Ok(());
        }

        log::debug!("creating qdrant collection '{}' (dim={})", collection, vector_size);
        let body = serde_json::json!({
            "vectors": { "size": vector_size, "distance": "Cosine" },
            "optimizers_config": { "default_segment_number": 2 },
            "replication_factor": 1,
        });
        let response = self
            .request(reqwest::Method::PUT, &format!("/collections/{collection}"))
            .json(&body)
            .send()
            .await?;
        check_status(response).await?;

        // Index the fields the pipeline filters on.
        for (field, schema) in [("doc_id", "keyword"), ("chunk_ix", "integer")] {
            let body = serde_json::json!({ "field_name": field, "field_schema": schema });
            let response = self
                .request(
                    reqwest::Method::PUT,
                    &format!("/collections/{collection}/index"),
                )
                .json(&body)
                .send()
                .await?;
            check_status(response).await?;
        }
        Ok(())
    }

    fn build_filter(filter: &HashMap<String, Value>) -> Option<Value> {
        let must: Vec<Value> = filter
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| serde_json::json!({ "key": key, "match": { "value": value } }))
            .collect();
        if must.is_empty() {
            None
        } else {
            Some(serde_json::json!({ "must": must }))
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, VectorStoreError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let message = response.text().await.unwrap_or_default();
        Err(VectorStoreError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn upsert(
        &self,
        namespace: &str,
        records: Vec<VectorRecord>,
    ) -> Result<(), VectorStoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let collection = self.collection_name(namespace);
        self.ensure_collection(&collection, records[0].embedding.len())
            .await?;

        let points: Vec<Value> = records
            .iter()
            .map(|record| {
                serde_json::json!({
                    "id": record.id,
                    "vector": record.embedding,
                    "payload": record.metadata,
                })
            })
            .collect();

        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/collections/{collection}/points?wait=true"),
            )
            .json(&serde_json::json!({ "points": points }))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
        filter: Option<&HashMap<String, Value>>,
    ) -> Result<Vec<VectorMatch>, VectorStoreError> {
        let collection = self.collection_name(namespace);
        let mut body = serde_json::json!({
            "vector": vector,
            "limit": top_k,
            "with_payload": true,
        });
        if let Some(filter) = filter.and_then(Self::build_filter) {
            body["filter"] = filter;
        }

        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{collection}/points/search"),
            )
            .json(&body)
            .send()
            .await?;

        // Namespace never written: no collection yet, no matches.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = check_status(response).await?;

        let payload: Value = response.json().await?;
        let results = payload
            .get("result")
            .and_then(Value::as_array)
            .ok_or_else(|| VectorStoreError::InvalidResponse("missing 'result' array".into()))?;

        Ok(results
            .iter()
            .map(|item| VectorMatch {
                id: item
                    .get("id")
                    .map(|id| match id {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_default(),
                score: item.get("score").and_then(Value::as_f64).unwrap_or(0.0) as f32,
                metadata: item
                    .get("payload")
                    .and_then(Value::as_object)
                    .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn delete(&self, namespace: &str, ids: &[String]) -> Result<(), VectorStoreError> {
        if ids.is_empty() {
            return Ok(());
        }

        let collection = self.collection_name(namespace);
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{collection}/points/delete?wait=true"),
            )
            .json(&serde_json::json!({ "points": ids }))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response).await?;
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), VectorStoreError> {
        let collection = self.collection_name(namespace);
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/collections/{collection}"),
            )
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response).await?;
        Ok(())
    }

    async fn count(&self, namespace: &str) -> Result<usize, VectorStoreError> {
        let collection = self.collection_name(namespace);
        let response = self
            .request(reqwest::Method::GET, &format!("/collections/{collection}"))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(0);
        }
        let response = check_status(response).await?;

        let payload: Value = response.json().await?;
        Ok(payload
            .pointer("/result/points_count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize)
    }
}
