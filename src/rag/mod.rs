//! Retrieval-augmented generation: chunking, embeddings, vector storage
//! and the pipeline tying them together.

pub mod chunker;
pub mod embeddings;
pub mod pipeline;
pub mod vector_store;

pub use chunker::{Chunk, ChunkOptions, Chunker, TokenCounter};
pub use embeddings::{cosine_similarity, create_embedding_provider, EmbeddingProvider};
pub use pipeline::{
    Document, IngestResult, NamespaceStats, RagPipeline, RetrieveOptions, RetrievedChunk,
};
pub use vector_store::{InMemoryVectorStore, QdrantStore, VectorMatch, VectorRecord, VectorStore};
