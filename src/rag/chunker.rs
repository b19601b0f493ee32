//! Token-aware text chunking.
//!
//! Splits document text into overlapping, token-bounded chunks suitable
//! for independent embedding and retrieval. Chunking is deterministic and
//! infallible: any string input yields zero or more chunks, never an error.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

static MULTI_NEWLINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());
static HORIZONTAL_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+").unwrap());
static PARAGRAPH_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\n+").unwrap());
static SENTENCE_BOUNDARY: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]+\s+").unwrap());

// ---------------------------------------------------------------------------
// Token counting
// ---------------------------------------------------------------------------

/// Counts tokens with a model tokenizer when one is loaded, falling back
/// to a `ceil(chars / 4)` estimate otherwise.
///
/// The fallback is explicitly approximate; it is stable enough for
/// re-chunking the same text but callers comparing counts across the two
/// paths should tolerate roughly ±15% variance.
pub struct TokenCounter {
    tokenizer: Option<Tokenizer>,
}

impl TokenCounter {
    /// Heuristic-only counter (the default).
    pub fn heuristic() -> Self {
        Self { tokenizer: None }
    }

    /// Counter backed by a HuggingFace tokenizer.
    pub fn with_tokenizer(tokenizer: Tokenizer) -> Self {
        Self {
            tokenizer: Some(tokenizer),
        }
    }

    /// Load a tokenizer from a `tokenizer.json` file.
    pub fn from_file(
        path: impl AsRef<std::path::Path>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let tokenizer = Tokenizer::from_file(path)?;
        Ok(Self::with_tokenizer(tokenizer))
    }

    /// Count tokens in `text`.
    pub fn count(&self, text: &str) -> usize {
        if let Some(tokenizer) = &self.tokenizer {
            if let Ok(encoding) = tokenizer.encode(text, false) {
                return encoding.get_ids().len();
            }
        }
        text.chars().count().div_ceil(4)
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::heuristic()
    }
}

// ---------------------------------------------------------------------------
// Options and output
// ---------------------------------------------------------------------------

/// Chunking parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkOptions {
    /// Token budget per chunk.
    pub target_tokens: usize,
    /// Token budget for the overlap tail carried into the next chunk.
    pub overlap: usize,
    /// Split on blank-line boundaries before accumulating.
    pub preserve_paragraphs: bool,
    /// Trailing buffers below this token count are dropped.
    pub min_chunk_size: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            target_tokens: 800,
            overlap: 120,
            preserve_paragraphs: true,
            min_chunk_size: 100,
        }
    }
}

/// One chunk of a document's normalized text.
///
/// `index` is sequential within one `chunk()` call. Offsets are
/// best-effort character positions into the normalized text; overlapping
/// text appears in two chunks' ranges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub content: String,
    pub token_count: usize,
    pub index: usize,
    pub start_offset: usize,
    pub end_offset: usize,
}

// ---------------------------------------------------------------------------
// Chunker
// ---------------------------------------------------------------------------

/// Deterministic text chunker.
pub struct Chunker {
    counter: TokenCounter,
}

impl Chunker {
    /// Chunker using the heuristic token counter.
    pub fn new() -> Self {
        Self {
            counter: TokenCounter::heuristic(),
        }
    }

    /// Chunker using a model tokenizer for counting.
    pub fn with_counter(counter: TokenCounter) -> Self {
        Self { counter }
    }

    /// Count tokens in `text` with this chunker's counter.
    pub fn count_tokens(&self, text: &str) -> usize {
        self.counter.count(text)
    }

    /// Split `text` into token-bounded, overlapping chunks.
    ///
    /// Empty or whitespace-only input yields zero chunks.
    pub fn chunk(&self, text: &str, options: &ChunkOptions) -> Vec<Chunk> {
        let normalized = normalize_text(text);
        if normalized.is_empty() {
            return Vec::new();
        }

        let segments = if options.preserve_paragraphs {
            split_paragraphs(&normalized)
        } else {
            vec![normalized.clone()]
        };

        let mut chunks: Vec<Chunk> = Vec::new();
        let mut current = String::new();
        let mut current_tokens = 0usize;
        let mut char_position = 0usize;

        for segment in &segments {
            let segment_tokens = self.counter.count(segment);

            // An oversized segment is split independently at sentence
            // boundaries and its chunks emitted immediately, bypassing
            // the running buffer.
            if segment_tokens > options.target_tokens {
                if !current.trim().is_empty() {
                    push_chunk(&mut chunks, current.trim(), current_tokens, char_position);
                    current.clear();
                    current_tokens = 0;
                }

                for sub in self.split_large_segment(segment, options) {
                    let tokens = self.counter.count(&sub);
                    let len = sub.chars().count();
                    chunks.push(Chunk {
                        content: sub,
                        token_count: tokens,
                        index: chunks.len(),
                        start_offset: char_position,
                        end_offset: char_position + len,
                    });
                    char_position += len;
                }
                continue;
            }

            if current_tokens + segment_tokens > options.target_tokens
                && !current.trim().is_empty()
            {
                push_chunk(&mut chunks, current.trim(), current_tokens, char_position);

                // Seed the new buffer with whole sentences from the tail
                // of the chunk just emitted.
                let overlap_text = self.overlap_tail(&current, options.overlap);
                current = if overlap_text.is_empty() {
                    segment.clone()
                } else {
                    format!("{}\n\n{}", overlap_text, segment)
                };
                current_tokens = self.counter.count(&current);
            } else {
                if !current.is_empty() {
                    current.push_str("\n\n");
                }
                current.push_str(segment);
                current_tokens = self.counter.count(&current);
            }

            char_position += segment.chars().count();
        }

        // The trailing buffer is only kept when it meets the minimum
        // size; smaller fragments are dropped.
        if !current.trim().is_empty() && self.counter.count(&current) >= options.min_chunk_size {
            push_chunk(&mut chunks, current.trim(), current_tokens, char_position);
        }

        chunks
    }

    /// Split a segment that alone exceeds the target budget, at sentence
    /// boundaries with the same greedy + overlap logic.
    fn split_large_segment(&self, text: &str, options: &ChunkOptions) -> Vec<String> {
        let sentences = split_sentences(text);
        let mut out: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut current_tokens = 0usize;

        for sentence in &sentences {
            let sentence_tokens = self.counter.count(sentence);

            if current_tokens + sentence_tokens > options.target_tokens && !current.is_empty() {
                out.push(current.trim().to_string());

                let overlap_text = self.overlap_tail(&current, options.overlap);
                current = if overlap_text.is_empty() {
                    sentence.clone()
                } else {
                    format!("{} {}", overlap_text, sentence)
                };
                current_tokens = self.counter.count(&current);
            } else {
                if !current.is_empty() {
                    current.push(' ');
                }
                current.push_str(sentence);
                current_tokens = self.counter.count(&current);
            }
        }

        if !current.trim().is_empty() {
            out.push(current.trim().to_string());
        }

        out
    }

    /// Whole sentences from the end of `text`, accumulated backward until
    /// adding one more would exceed the overlap token budget.
    fn overlap_tail(&self, text: &str, overlap_tokens: usize) -> String {
        let sentences = split_sentences(text);
        let mut tail = String::new();
        let mut tokens = 0usize;

        for sentence in sentences.iter().rev() {
            let sentence_tokens = self.counter.count(sentence);
            if tokens + sentence_tokens > overlap_tokens {
                break;
            }
            if tail.is_empty() {
                tail = sentence.clone();
            } else {
                tail = format!("{} {}", sentence, tail);
            }
            tokens += sentence_tokens;
        }

        tail
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new()
    }
}

fn push_chunk(chunks: &mut Vec<Chunk>, content: &str, tokens: usize, char_position: usize) {
    let len = content.chars().count();
    chunks.push(Chunk {
        content: content.to_string(),
        token_count: tokens,
        index: chunks.len(),
        start_offset: char_position.saturating_sub(len),
        end_offset: char_position,
    });
}

/// Collapse CRLF to LF, 3+ newlines to 2, runs of horizontal whitespace
/// to a single space, then trim.
fn normalize_text(text: &str) -> String {
    let unix = text.replace("\r\n", "\n");
    let collapsed = MULTI_NEWLINE.replace_all(&unix, "\n\n");
    let spaced = HORIZONTAL_WS.replace_all(&collapsed, " ");
    spaced.trim().to_string()
}

fn split_paragraphs(text: &str) -> Vec<String> {
    PARAGRAPH_BREAK
        .split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

/// Split on `[.!?]+` followed by whitespace, keeping terminators with
/// their sentence.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut last = 0usize;

    for m in SENTENCE_BOUNDARY.find_iter(text) {
        let sentence = text[last..m.end()].trim();
        if !sentence.is_empty() {
            sentences.push(sentence.to_string());
        }
        last = m.end();
    }

    let rest = text[last..].trim();
    if !rest.is_empty() {
        sentences.push(rest.to_string());
    }

    sentences
}
