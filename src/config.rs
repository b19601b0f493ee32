//! Configuration for embedding, vector store and LLM backends.
//!
//! Every config can be built explicitly or loaded from the environment
//! with `from_env()`. Provider selection is always explicit configuration
//! passed at construction; there is no global registry.

use serde::{Deserialize, Serialize};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

// ---------------------------------------------------------------------------
// Embeddings
// ---------------------------------------------------------------------------

/// Which embedding backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// OpenAI embeddings API.
    Openai,
    /// Any OpenAI-compatible endpoint (local/self-hosted).
    Custom,
}

/// Configuration for an embedding provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackend,
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub dimensions: usize,
    /// Inputs per upstream request.
    pub batch_size: usize,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl EmbeddingConfig {
    pub fn from_env() -> Self {
        let backend = match env_or("EMBEDDINGS_PROVIDER", "openai").to_lowercase().as_str() {
            "custom" | "local" => EmbeddingBackend::Custom,
            _ => EmbeddingBackend::Openai,
        };
        Self {
            backend,
            api_base: env_or("EMBEDDINGS_API_BASE", "https://api.openai.com/v1"),
            api_key: env_or("EMBEDDINGS_API_KEY", ""),
            model: env_or("EMBEDDINGS_MODEL", "text-embedding-3-large"),
            dimensions: env_or("EMBEDDINGS_DIMENSIONS", "1536").parse().unwrap_or(1536),
            batch_size: 100,
            timeout_secs: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// Vector store
// ---------------------------------------------------------------------------

/// Configuration for the Qdrant vector store backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
    /// Prepended to every namespace to form the collection name.
    pub collection_prefix: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl QdrantConfig {
    pub fn from_env() -> Self {
        Self {
            url: env_or("VECTOR_DB_URL", "http://localhost:6333"),
            api_key: std::env::var("VECTOR_DB_KEY").ok(),
            collection_prefix: env_or("VECTOR_DB_COLLECTION_PREFIX", "ratu_"),
            timeout_secs: 30,
        }
    }
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6333".to_string(),
            api_key: None,
            collection_prefix: "ratu_".to_string(),
            timeout_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// LLM
// ---------------------------------------------------------------------------

/// Configuration for the Kimi K2 chat client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KimiConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Attempt cap for the retry loop.
    pub max_retries: u32,
}

impl KimiConfig {
    pub fn from_env() -> Self {
        Self {
            api_base: env_or("KIMI_K2_API_BASE", "https://api.moonshot.cn/v1"),
            api_key: env_or("KIMI_K2_API_KEY", ""),
            model: env_or("KIMI_K2_MODEL", "moonshot-v1-128k"),
            max_tokens: env_or("KIMI_K2_MAX_TOKENS", "4096").parse().unwrap_or(4096),
            temperature: env_or("KIMI_K2_TEMPERATURE", "0.4").parse().unwrap_or(0.4),
            timeout_secs: 60,
            max_retries: 3,
        }
    }
}

impl Default for KimiConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.moonshot.cn/v1".to_string(),
            api_key: String::new(),
            model: "moonshot-v1-128k".to_string(),
            max_tokens: 4096,
            temperature: 0.4,
            timeout_secs: 60,
            max_retries: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kimi_config_defaults() {
        let config = KimiConfig::default();
        assert_eq!(config.model, "moonshot-v1-128k");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_tokens, 4096);
    }

    #[test]
    fn test_qdrant_config_default_prefix() {
        let config = QdrantConfig::default();
        assert_eq!(config.collection_prefix, "ratu_");
    }
}
