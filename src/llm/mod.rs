//! Language model client.
//!
//! Provides the [`ChatCompletion`] trait the council engine talks to, a
//! Kimi K2 (Moonshot) implementation, citation-marker parsing, and the
//! prompt builders shared by the chat and council paths.
//!
//! Citation markers are the wire format linking model claims back to
//! source chunks: `[CIT:<doc_id>:<chunk_index>]`, where `doc_id` matches
//! `[a-z0-9-]+` and `chunk_index` is a non-negative integer. The format
//! is consumed by UIs and re-embedded into synthesis and critic prompts,
//! so it must stay bit-exact.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::KimiConfig;
use crate::error::LlmError;
use crate::rag::pipeline::RetrievedChunk;

static CITATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[CIT:([a-z0-9-]+):(\d+)\]").unwrap());

// ---------------------------------------------------------------------------
// Messages and usage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Per-call overrides for a chat completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Tool schemas forwarded verbatim to the API.
    pub tools: Option<Vec<Value>>,
}

/// Token usage reported by the model for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Result of one chat completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub usage: Usage,
}

/// Stateless chat-completion backend.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError>;
}

// ---------------------------------------------------------------------------
// Citations
// ---------------------------------------------------------------------------

/// A claim-to-source link extracted from model output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub doc_id: String,
    pub chunk_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

impl Citation {
    pub fn new(doc_id: impl Into<String>, chunk_index: u32) -> Self {
        Self {
            doc_id: doc_id.into(),
            chunk_index,
            title: None,
            uri: None,
            snippet: None,
        }
    }

    /// Key used for deduplication.
    pub fn key(&self) -> (&str, u32) {
        (&self.doc_id, self.chunk_index)
    }
}

/// Render the bit-exact citation marker for `(doc_id, chunk_index)`.
pub fn format_citation(doc_id: &str, chunk_index: u32) -> String {
    format!("[CIT:{}:{}]", doc_id, chunk_index)
}

/// Extract citation markers from model output.
///
/// Pure function, independent of any network call. Malformed markers
/// (wrong delimiter, missing index, out-of-range numbers) are skipped —
/// a broken marker yields zero citations, never an error. Duplicates are
/// removed, keeping first-occurrence order.
pub fn parse_citations(text: &str) -> Vec<Citation> {
    let mut seen: std::collections::HashSet<(String, u32)> = std::collections::HashSet::new();
    let mut citations = Vec::new();

    for caps in CITATION_RE.captures_iter(text) {
        let doc_id = caps[1].to_string();
        let Ok(chunk_index) = caps[2].parse::<u32>() else {
            continue;
        };
        if seen.insert((doc_id.clone(), chunk_index)) {
            citations.push(Citation::new(doc_id, chunk_index));
        }
    }

    citations
}

/// Fill `title`/`uri`/`snippet` on citations that match a retrieved
/// chunk by `(doc_id, chunk_index)`.
pub fn enrich_citations(citations: &mut [Citation], retrieved: &[RetrievedChunk]) {
    let by_key: HashMap<(String, u32), &RetrievedChunk> = retrieved
        .iter()
        .map(|chunk| ((chunk.doc_id.clone(), chunk.chunk_index), chunk))
        .collect();

    for citation in citations.iter_mut() {
        let key = (citation.doc_id.clone(), citation.chunk_index);
        if let Some(chunk) = by_key.get(&key) {
            citation.title = chunk
                .metadata
                .get("title")
                .and_then(Value::as_str)
                .map(String::from);
            citation.uri = chunk
                .metadata
                .get("uri")
                .and_then(Value::as_str)
                .map(String::from);
            let snippet: String = chunk.content.chars().take(200).collect();
            citation.snippet = Some(snippet);
        }
    }
}

// ---------------------------------------------------------------------------
// Prompt builders
// ---------------------------------------------------------------------------

/// System prompt for the single-agent chat path.
pub fn build_system_prompt(org_name: &str, context: Option<&str>) -> String {
    let context_block = match context {
        Some(context) => format!("RETRIEVED CONTEXT:\n{}\n", context),
        None => String::new(),
    };
    format!(
        "You are Ratu, the Sovereign AI assistant for {org_name}.\n\
         \n\
         IMPORTANT RULES:\n\
         1. The base model is FROZEN and never retrained. Do not claim to have been trained on new data.\n\
         2. Answer ONLY from the retrieved context provided below.\n\
         3. Cite ALL sources using the format [CIT:doc_id:chunk_ix] inline in your response.\n\
         4. If the context is insufficient, say \"I don't have that information yet\" and suggest which source should be crawled.\n\
         5. Be precise, factual, and cite every claim.\n\
         6. Never make up information or hallucinate facts.\n\
         \n\
         {context_block}\n\
         Provide your answer with inline citations."
    )
}

/// Role-specific system prompt for council agents.
///
/// Unknown `kind` values fall back to the analyst archetype.
pub fn build_role_prompt(kind: &str, org_name: &str, context: Option<&str>) -> String {
    let instructions = match kind.to_lowercase().as_str() {
        "researcher" => format!(
            "You are the Researcher for {org_name}. Your role is to:\n\
             - Find and extract relevant facts from the context\n\
             - List key information with citations [CIT:doc_id:chunk_ix]\n\
             - Note any gaps or missing information\n\
             - Be thorough and systematic"
        ),
        "editor" => format!(
            "You are the Editor for {org_name}. Your role is to:\n\
             - Review and refine the analysis\n\
             - Ensure clarity and coherence\n\
             - Verify all citations are present\n\
             - Produce the final polished output"
        ),
        "critic" => format!(
            "You are the Critic for {org_name}. Your role is to:\n\
             - Challenge assumptions and conclusions\n\
             - Check citation adequacy\n\
             - Identify logical flaws or gaps\n\
             - Propose clarifying questions"
        ),
        _ => format!(
            "You are the Analyst for {org_name}. Your role is to:\n\
             - Synthesize facts into concise, actionable conclusions\n\
             - Provide citations [CIT:doc_id:chunk_ix] for all claims\n\
             - Flag ambiguities or contradictions\n\
             - Offer clear recommendations"
        ),
    };

    let context_block = match context {
        Some(context) => format!("RETRIEVED CONTEXT:\n{}\n", context),
        None => String::new(),
    };
    format!("{instructions}\n\n{context_block}\nProvide your analysis with inline citations.")
}

// ---------------------------------------------------------------------------
// Kimi K2 client
// ---------------------------------------------------------------------------

/// Kimi K2 (Moonshot) chat-completions client.
///
/// Retries transport failures, 429s and 5xx responses with exponential
/// backoff up to the configured attempt cap; 4xx responses fail
/// immediately and are never retried.
pub struct KimiClient {
    config: KimiConfig,
    client: reqwest::Client,
}

impl KimiClient {
    pub fn new(config: KimiConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    pub fn from_env() -> Self {
        Self::new(KimiConfig::from_env())
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Single-prompt convenience wrapper around [`ChatCompletion::chat`].
    pub async fn complete(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<String, LlmError> {
        let mut messages = Vec::new();
        if let Some(system) = system_prompt {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(prompt));

        let response = self.chat(&messages, &ChatOptions::default()).await?;
        Ok(response.content)
    }

    fn build_request_body(&self, messages: &[ChatMessage], options: &ChatOptions) -> Value {
        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": options.temperature.unwrap_or(self.config.temperature),
            "max_tokens": options.max_tokens.unwrap_or(self.config.max_tokens),
            "stream": false,
        });
        if let Some(tools) = &options.tools {
            if !tools.is_empty() {
                body["tools"] = serde_json::json!(tools);
            }
        }
        body
    }

    fn parse_response(payload: &Value) -> Result<ChatResponse, LlmError> {
        let content = payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let usage = payload.get("usage").ok_or_else(|| {
            LlmError::InvalidResponse("missing 'usage' in chat response".into())
        })?;
        let usage = Usage {
            prompt_tokens: usage
                .get("prompt_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            completion_tokens: usage
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            total_tokens: usage
                .get("total_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
        };

        Ok(ChatResponse { content, usage })
    }
}

#[async_trait]
impl ChatCompletion for KimiClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        if self.config.api_key.is_empty() {
            return Err(LlmError::MissingApiKey);
        }

        let body = self.build_request_body(messages, options);
        let endpoint = format!("{}/chat/completions", self.config.api_base);
        let mut last_error = String::new();

        for attempt in 0..self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_millis((1000u64 << (attempt - 1)).min(10_000));
                log::warn!("kimi chat retry attempt {} after {:?}", attempt, delay);
                tokio::time::sleep(delay).await;
            }

            let response = match self
                .client
                .post(&endpoint)
                .header("Authorization", format!("Bearer {}", self.config.api_key))
                .json(&body)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };

            let status = response.status();

            // Rate limits and server errors are retryable.
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                last_error = format!("kimi API returned {}", status);
                continue;
            }

            let text = match response.text().await {
                Ok(text) => text,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };

            // Client errors are surfaced immediately, never retried.
            if status.is_client_error() {
                return Err(LlmError::Api {
                    status: status.as_u16(),
                    message: text,
                });
            }

            let payload: Value = serde_json::from_str(&text).map_err(|e| {
                LlmError::InvalidResponse(format!("not JSON: {} ({})", e, truncate(&text, 200)))
            })?;
            return Self::parse_response(&payload);
        }

        Err(LlmError::Exhausted {
            attempts: self.config.max_retries,
            message: last_error,
        })
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
