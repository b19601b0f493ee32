//! Embedding providers.
//!
//! An [`EmbeddingProvider`] maps text segments to fixed-dimension vectors.
//! Providers batch internally and surface upstream failures as
//! [`EmbeddingError`]; the RAG pipeline treats those as fatal for the
//! current ingest/retrieve call and does not retry at its layer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{EmbeddingBackend, EmbeddingConfig};
use crate::error::EmbeddingError;

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// Text-to-vector conversion backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed `texts`, order-preserving, one vector per input string.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Fixed output dimensionality.
    fn dimensions(&self) -> usize;

    /// Model identifier.
    fn model(&self) -> &str;
}

/// Build a provider from explicit configuration.
pub fn create_embedding_provider(config: &EmbeddingConfig) -> Arc<dyn EmbeddingProvider> {
    match config.backend {
        EmbeddingBackend::Openai => Arc::new(OpenAiEmbeddings::new(config.clone())),
        EmbeddingBackend::Custom => Arc::new(CustomEmbeddings::new(config.clone())),
    }
}

// ---------------------------------------------------------------------------
// OpenAI embeddings
// ---------------------------------------------------------------------------

/// OpenAI embeddings API client.
pub struct OpenAiEmbeddings {
    config: EmbeddingConfig,
    client: reqwest::Client,
}

impl OpenAiEmbeddings {
    pub fn new(config: EmbeddingConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.config.model,
            "input": texts,
            "dimensions": self.config.dimensions,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.config.api_base))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let payload: Value = response.json().await?;
        let data = payload
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| EmbeddingError::InvalidResponse("missing 'data' array".into()))?;

        let mut items: Vec<(i64, Vec<f32>)> = Vec::with_capacity(texts.len());
        for item in data {
            let index = item.get("index").and_then(Value::as_i64).unwrap_or(0);
            let embedding = parse_vector(item.get("embedding"))?;
            items.push((index, embedding));
        }

        // The API may return items out of order.
        items.sort_by_key(|(index, _)| *index);
        Ok(items.into_iter().map(|(_, v)| v).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.batch_size.max(1)) {
            log::debug!(
                "embedding batch of {} texts ({})",
                batch.len(),
                self.config.model
            );
            all.extend(self.embed_batch(batch).await?);
        }
        Ok(all)
    }

    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}

// ---------------------------------------------------------------------------
// Custom / local embeddings
// ---------------------------------------------------------------------------

/// Client for OpenAI-compatible embedding endpoints (local or self-hosted
/// models). Tolerates the common response shapes: a bare array of
/// vectors, `{"data": [{"embedding": ..}]}`, or `{"embeddings": [..]}`.
pub struct CustomEmbeddings {
    config: EmbeddingConfig,
    client: reqwest::Client,
}

impl CustomEmbeddings {
    pub fn new(config: EmbeddingConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.config.model,
            "input": texts,
        });

        let mut request = self
            .client
            .post(format!("{}/embeddings", self.config.api_base))
            .json(&body);
        if !self.config.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.config.api_key));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let payload: Value = response.json().await?;
        parse_embeddings_payload(&payload)
    }
}

#[async_trait]
impl EmbeddingProvider for CustomEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.batch_size.max(1)) {
            all.extend(self.embed_batch(batch).await?);
        }
        Ok(all)
    }

    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}

fn parse_embeddings_payload(payload: &Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if let Some(array) = payload.as_array() {
        return array.iter().map(|v| parse_vector(Some(v))).collect();
    }

    if let Some(data) = payload.get("data").and_then(Value::as_array) {
        let mut items: Vec<(i64, Vec<f32>)> = Vec::with_capacity(data.len());
        for item in data {
            let index = item.get("index").and_then(Value::as_i64).unwrap_or(0);
            let embedding = parse_vector(item.get("embedding").or(Some(item)))?;
            items.push((index, embedding));
        }
        items.sort_by_key(|(index, _)| *index);
        return Ok(items.into_iter().map(|(_, v)| v).collect());
    }

    if let Some(embeddings) = payload.get("embeddings").and_then(Value::as_array) {
        return embeddings.iter().map(|v| parse_vector(Some(v))).collect();
    }

    Err(EmbeddingError::InvalidResponse(
        "unrecognized embedding response shape".into(),
    ))
}

fn parse_vector(value: Option<&Value>) -> Result<Vec<f32>, EmbeddingError> {
    value
        .and_then(Value::as_array)
        .map(|array| {
            array
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect()
        })
        .ok_or_else(|| EmbeddingError::InvalidResponse("embedding is not an array".into()))
}

// ---------------------------------------------------------------------------
// Vector math
// ---------------------------------------------------------------------------

/// Cosine similarity between two vectors of equal length.
///
/// Returns 0.0 for zero-norm inputs rather than NaN.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}
