//! Error types for the Ratu core.
//!
//! Each subsystem has its own error enum so callers can distinguish
//! transient upstream failures (retried at the client layer) from
//! client/validation failures (surfaced immediately).

use thiserror::Error;

/// Errors from embedding providers.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Non-success status from the upstream embedding API.
    #[error("embedding API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Transport-level failure (connection, timeout, TLS).
    #[error("embedding request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The upstream returned a body we could not interpret.
    #[error("unexpected embedding response: {0}")]
    InvalidResponse(String),
}

/// Errors from vector store backends.
#[derive(Debug, Error)]
pub enum VectorStoreError {
    /// Non-success status from the vector store API.
    #[error("vector store error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Transport-level failure.
    #[error("vector store request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The store returned a body we could not interpret.
    #[error("unexpected vector store response: {0}")]
    InvalidResponse(String),
}

/// Errors from the language model client.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Client-side (4xx) API error. Never retried.
    #[error("LLM API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// All retry attempts exhausted; carries the last underlying cause.
    #[error("LLM call failed after {attempts} attempts: {message}")]
    Exhausted { attempts: u32, message: String },

    /// The model returned a body we could not interpret.
    #[error("unexpected LLM response: {0}")]
    InvalidResponse(String),

    /// No API key configured for the client.
    #[error("LLM API key not set")]
    MissingApiKey,
}

/// Errors from the RAG pipeline.
#[derive(Debug, Error)]
pub enum RagError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    VectorStore(#[from] VectorStoreError),

    /// Structural invariant violation: batched embedding must return
    /// exactly one vector per chunk. Never truncated silently.
    #[error("embedding count {embeddings} does not match chunk count {chunks}")]
    EmbeddingCountMismatch { embeddings: usize, chunks: usize },
}

/// Errors from a council run.
///
/// A single role failing aborts consensus and deliberate runs entirely;
/// the critic addendum is the one degrade-gracefully path and never
/// surfaces through this type.
#[derive(Debug, Error)]
pub enum CouncilError {
    /// A role's chat call failed after the client's retry budget.
    #[error("council role '{role}' failed: {source}")]
    RoleCall {
        role: String,
        #[source]
        source: LlmError,
    },

    /// The synthesis call failed.
    #[error("council synthesis failed: {0}")]
    Synthesis(#[from] LlmError),
}
