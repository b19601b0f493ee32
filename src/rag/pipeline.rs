//! RAG pipeline.
//!
//! Orchestrates ingest and retrieval around the chunker, an embedding
//! provider and a vector store for one tenant/namespace pair. The
//! namespace is pipeline-level configuration; no call ever crosses it.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::RagError;
use crate::rag::chunker::{ChunkOptions, Chunker};
use crate::rag::embeddings::EmbeddingProvider;
use crate::rag::vector_store::{VectorRecord, VectorStore};

/// Metadata keys owned by the pipeline. Document metadata colliding with
/// these is overwritten; reserved keys always win.
const RESERVED_KEYS: [&str; 9] = [
    "org_id",
    "doc_id",
    "chunk_ix",
    "uri",
    "title",
    "content",
    "tokens",
    "start_char",
    "end_char",
];

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// A document to ingest. `id` must be stable across re-ingests of the
/// logically-same document so the delete/update lifecycle works.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub uri: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Outcome of one ingest call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResult {
    pub doc_id: String,
    pub chunk_count: usize,
    pub total_tokens: usize,
    pub embedded: bool,
}

/// Transient result of a similarity query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub chunk_index: u32,
    pub content: String,
    pub score: f32,
    pub metadata: HashMap<String, Value>,
}

/// Options for [`RagPipeline::retrieve`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveOptions {
    pub top_k: usize,
    pub filter: Option<HashMap<String, Value>>,
    /// Matches scoring below this are dropped. Default 0.0 keeps
    /// everything non-negative.
    pub min_score: f32,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            top_k: 6,
            filter: None,
            min_score: 0.0,
        }
    }
}

/// Namespace statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceStats {
    pub namespace: String,
    pub vector_count: usize,
    pub dimensions: usize,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct RagPipeline {
    org_id: String,
    namespace: String,
    chunker: Chunker,
    chunk_options: ChunkOptions,
    embeddings: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
}

impl RagPipeline {
    pub fn new(
        org_id: impl Into<String>,
        namespace: impl Into<String>,
        embeddings: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            org_id: org_id.into(),
            namespace: namespace.into(),
            chunker: Chunker::new(),
            chunk_options: ChunkOptions::default(),
            embeddings,
            store,
        }
    }

    /// Builder: override chunking parameters.
    pub fn with_chunk_options(mut self, options: ChunkOptions) -> Self {
        self.chunk_options = options;
        self
    }

    /// Builder: use a model tokenizer for chunk sizing.
    pub fn with_chunker(mut self, chunker: Chunker) -> Self {
        self.chunker = chunker;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Chunk, embed and upsert one document.
    ///
    /// Zero-chunk documents (empty or whitespace-only content) are legal
    /// and return `embedded: false` with zero counts.
    pub async fn ingest(&self, document: &Document) -> Result<IngestResult, RagError> {
        let chunks = self.chunker.chunk(&document.content, &self.chunk_options);
        if chunks.is_empty() {
            return Ok(IngestResult {
                doc_id: document.id.clone(),
                chunk_count: 0,
                total_tokens: 0,
                embedded: false,
            });
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self.embeddings.embed(&texts).await?;
        if embeddings.len() != chunks.len() {
            // One vector per chunk is a structural invariant of batched
            // embedding; a mismatch is fatal, never truncated.
            return Err(RagError::EmbeddingCountMismatch {
                embeddings: embeddings.len(),
                chunks: chunks.len(),
            });
        }

        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| {
                let mut metadata = document.metadata.clone();
                // Reserved keys win over document metadata.
                metadata.insert("org_id".into(), Value::String(self.org_id.clone()));
                metadata.insert("doc_id".into(), Value::String(document.id.clone()));
                metadata.insert("chunk_ix".into(), Value::from(chunk.index as u64));
                metadata.insert("uri".into(), Value::String(document.uri.clone()));
                metadata.insert("title".into(), Value::String(document.title.clone()));
                metadata.insert("content".into(), Value::String(chunk.content.clone()));
                metadata.insert("tokens".into(), Value::from(chunk.token_count as u64));
                metadata.insert("start_char".into(), Value::from(chunk.start_offset as u64));
                metadata.insert("end_char".into(), Value::from(chunk.end_offset as u64));

                VectorRecord {
                    id: generate_chunk_id(&document.id, chunk.index as u32),
                    embedding,
                    metadata,
                }
            })
            .collect();

        self.store.upsert(&self.namespace, records).await?;

        let total_tokens = chunks.iter().map(|c| c.token_count).sum();
        log::debug!(
            "ingested doc '{}' into '{}': {} chunks, {} tokens",
            document.id,
            self.namespace,
            chunks.len(),
            total_tokens
        );

        Ok(IngestResult {
            doc_id: document.id.clone(),
            chunk_count: chunks.len(),
            total_tokens,
            embedded: true,
        })
    }

    /// Ingest documents in bounded-concurrency batches.
    pub async fn ingest_batch(
        &self,
        documents: &[Document],
        concurrency: usize,
        on_progress: Option<&(dyn Fn(usize, usize) + Send + Sync)>,
    ) -> Result<Vec<IngestResult>, RagError> {
        let concurrency = concurrency.max(1);
        let mut results = Vec::with_capacity(documents.len());

        for batch in documents.chunks(concurrency) {
            let batch_results =
                try_join_all(batch.iter().map(|document| self.ingest(document))).await?;
            results.extend(batch_results);
            if let Some(on_progress) = on_progress {
                on_progress(results.len(), documents.len());
            }
        }

        Ok(results)
    }

    /// Embed a query and return its nearest chunks.
    pub async fn retrieve(
        &self,
        query: &str,
        options: &RetrieveOptions,
    ) -> Result<Vec<RetrievedChunk>, RagError> {
        let mut embeddings = self.embeddings.embed(&[query.to_string()]).await?;
        if embeddings.is_empty() {
            return Err(RagError::EmbeddingCountMismatch {
                embeddings: 0,
                chunks: 1,
            });
        }
        let query_vector = embeddings.remove(0);

        let matches = self
            .store
            .query(
                &self.namespace,
                &query_vector,
                options.top_k,
                options.filter.as_ref(),
            )
            .await?;

        Ok(matches
            .into_iter()
            .filter(|m| m.score >= options.min_score)
            .map(|m| {
                let doc_id = m
                    .metadata
                    .get("doc_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let chunk_index = m
                    .metadata
                    .get("chunk_ix")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32;
                let content = m
                    .metadata
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();

                let mut metadata = HashMap::new();
                for key in ["uri", "title", "tokens", "start_char", "end_char"] {
                    if let Some(value) = m.metadata.get(key) {
                        metadata.insert(key.to_string(), value.clone());
                    }
                }

                RetrievedChunk {
                    chunk_id: m.id,
                    doc_id,
                    chunk_index,
                    content,
                    score: m.score,
                    metadata,
                }
            })
            .collect())
    }

    /// Retrieve for several queries, deduplicate by chunk id and sort by
    /// descending score.
    pub async fn retrieve_multi(
        &self,
        queries: &[String],
        options: &RetrieveOptions,
    ) -> Result<Vec<RetrievedChunk>, RagError> {
        let all = try_join_all(queries.iter().map(|query| self.retrieve(query, options))).await?;

        let mut seen = std::collections::HashSet::new();
        let mut chunks: Vec<RetrievedChunk> = all
            .into_iter()
            .flatten()
            .filter(|chunk| seen.insert(chunk.chunk_id.clone()))
            .collect();
        chunks.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(chunks)
    }

    /// Render retrieved chunks as a citation-tagged context string.
    ///
    /// Blocks keep the order the chunks were passed in; sorting is the
    /// caller's decision. Zero chunks renders the empty string.
    pub fn build_context(chunks: &[RetrievedChunk]) -> String {
        chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let title = chunk
                    .metadata
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                format!(
                    "Document {} [CIT:{}:{}]:\nTitle: {}\nContent: {}",
                    i + 1,
                    chunk.doc_id,
                    chunk.chunk_index,
                    title,
                    chunk.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    }

    /// Remove every chunk belonging to `doc_id`.
    ///
    /// The store has no delete-by-filter, so the document's chunk ids
    /// are enumerated with an oversized query first. Not atomic with a
    /// subsequent re-ingest; documents are eventually consistent.
    pub async fn delete_document(&self, doc_id: &str) -> Result<(), RagError> {
        let probe = vec![0.0f32; self.embeddings.dimensions()];
        let mut filter = HashMap::new();
        filter.insert("doc_id".to_string(), Value::String(doc_id.to_string()));

        let matches = self
            .store
            .query(&self.namespace, &probe, 10_000, Some(&filter))
            .await?;

        let ids: Vec<String> = matches.into_iter().map(|m| m.id).collect();
        if !ids.is_empty() {
            log::debug!("deleting {} chunks of doc '{}'", ids.len(), doc_id);
            self.store.delete(&self.namespace, &ids).await?;
        }
        Ok(())
    }

    /// Delete-then-ingest. Not atomic; see [`Self::delete_document`].
    pub async fn update_document(&self, document: &Document) -> Result<IngestResult, RagError> {
        self.delete_document(&document.id).await?;
        self.ingest(document).await
    }

    /// Remove the whole namespace.
    pub async fn clear(&self) -> Result<(), RagError> {
        self.store.delete_namespace(&self.namespace).await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<NamespaceStats, RagError> {
        let vector_count = self.store.count(&self.namespace).await?;
        Ok(NamespaceStats {
            namespace: self.namespace.clone(),
            vector_count,
            dimensions: self.embeddings.dimensions(),
        })
    }

    /// Keys that document metadata cannot override.
    pub fn reserved_metadata_keys() -> &'static [&'static str] {
        &RESERVED_KEYS
    }
}

/// Deterministic vector id for `(doc_id, chunk_index)`.
///
/// First 16 bytes of SHA-256 over `"doc_id:chunk_index"`, rendered as a
/// canonical UUID so the id is also valid as a Qdrant point id.
/// Re-ingesting the same document+index always yields the same id.
pub fn generate_chunk_id(doc_id: &str, chunk_index: u32) -> String {
    let digest = Sha256::digest(format!("{}:{}", doc_id, chunk_index).as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}
