//! ratu-core: multi-tenant retrieval-augmented generation with a
//! multi-agent council on top.
//!
//! The crate is organized in three layers:
//!
//! - [`rag`] — token-aware chunking, embedding providers, namespace-scoped
//!   vector stores, and the [`rag::RagPipeline`] that ties them together
//!   per tenant.
//! - [`llm`] — the [`llm::ChatCompletion`] trait, the Kimi K2 client, and
//!   citation-marker parsing (`[CIT:doc_id:chunk_ix]`).
//! - [`council`] — the [`council::Council`] engine running role-prompted
//!   panels over retrieved context with consensus, deliberate, or critic
//!   strategies.
//!
//! A typical flow: ingest documents through a [`rag::RagPipeline`],
//! retrieve chunks for a query, render them with
//! [`rag::RagPipeline::build_context`], and hand the context to either a
//! single [`llm::KimiClient`] chat or a [`council::Council`] run.

pub mod config;
pub mod council;
pub mod error;
pub mod llm;
pub mod rag;

pub use config::{EmbeddingBackend, EmbeddingConfig, KimiConfig, QdrantConfig};
pub use council::{
    Council, CouncilContext, CouncilNote, CouncilResult, CouncilRole, CouncilStrategy, RoleKind,
};
pub use error::{CouncilError, EmbeddingError, LlmError, RagError, VectorStoreError};
pub use llm::{
    parse_citations, ChatCompletion, ChatMessage, ChatOptions, ChatResponse, ChatRole, Citation,
    KimiClient, Usage,
};
pub use rag::{
    Chunk, ChunkOptions, Chunker, Document, EmbeddingProvider, InMemoryVectorStore, IngestResult,
    QdrantStore, RagPipeline, RetrieveOptions, RetrievedChunk, TokenCounter, VectorStore,
};
