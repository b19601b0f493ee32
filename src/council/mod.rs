//! Multi-agent council engine.
//!
//! A council runs a panel of role-prompted agents over one query and a
//! shared retrieved context, then synthesizes their notes into a single
//! cited answer. Three strategies are supported:
//!
//! - **consensus**: every role answers independently and concurrently,
//!   then one synthesis call merges the notes.
//! - **deliberate**: multiple rounds; within a round the roles run
//!   concurrently, and from the second round onward each role sees the
//!   accumulated notes of all previous rounds.
//! - **critic**: consensus first, then one extra critic call reviews the
//!   provisional answer. A failed critic call degrades gracefully to the
//!   provisional answer instead of failing the whole run.

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::CouncilError;
use crate::llm::{
    build_role_prompt, parse_citations, ChatCompletion, ChatMessage, ChatOptions, Citation, Usage,
};

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Built-in role archetypes. [`RoleKind::Custom`] roles rely on their own
/// system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleKind {
    Researcher,
    Analyst,
    Editor,
    Critic,
    Custom,
}

impl RoleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleKind::Researcher => "researcher",
            RoleKind::Analyst => "analyst",
            RoleKind::Editor => "editor",
            RoleKind::Critic => "critic",
            RoleKind::Custom => "custom",
        }
    }
}

/// One seat on the council.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilRole {
    /// Display name; also the key in panel notes and error reports.
    pub name: String,
    pub kind: RoleKind,
    /// Full system prompt override. When `None` the archetype prompt for
    /// `kind` is built at run time with the query's context embedded.
    pub system_prompt: Option<String>,
}

impl CouncilRole {
    pub fn new(name: impl Into<String>, kind: RoleKind) -> Self {
        Self {
            name: name.into(),
            kind,
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

/// The standard three-seat panel.
pub fn default_roles() -> Vec<CouncilRole> {
    vec![
        CouncilRole::new("researcher", RoleKind::Researcher),
        CouncilRole::new("analyst", RoleKind::Analyst),
        CouncilRole::new("editor", RoleKind::Editor),
    ]
}

// ---------------------------------------------------------------------------
// Strategies, inputs, outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum CouncilStrategy {
    Consensus,
    Deliberate { rounds: usize },
    Critic,
}

impl Default for CouncilStrategy {
    fn default() -> Self {
        CouncilStrategy::Consensus
    }
}

impl CouncilStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            CouncilStrategy::Consensus => "consensus",
            CouncilStrategy::Deliberate { .. } => "deliberate",
            CouncilStrategy::Critic => "critic",
        }
    }
}

/// Query-scoped inputs shared by every role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilContext {
    pub query: String,
    /// Citation-tagged context from the RAG pipeline, if any.
    pub retrieved_context: Option<String>,
    pub org_name: String,
}

/// One role's contribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilNote {
    pub role: String,
    pub notes: String,
    pub citations: Vec<Citation>,
    pub tokens_used: Usage,
}

/// Outcome of a full council run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilResult {
    pub final_answer: String,
    pub panel: Vec<CouncilNote>,
    /// Deduplicated union of every panel note's citations, first-seen
    /// order by `(doc_id, chunk_index)`.
    pub all_citations: Vec<Citation>,
    pub total_tokens_in: u32,
    pub total_tokens_out: u32,
    pub strategy: String,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Council {
    client: Arc<dyn ChatCompletion>,
    roles: Vec<CouncilRole>,
}

impl Council {
    pub fn new(client: Arc<dyn ChatCompletion>) -> Self {
        Self {
            client,
            roles: default_roles(),
        }
    }

    /// Builder: replace the default panel.
    pub fn with_roles(mut self, roles: Vec<CouncilRole>) -> Self {
        self.roles = roles;
        self
    }

    pub fn roles(&self) -> &[CouncilRole] {
        &self.roles
    }

    pub async fn run(
        &self,
        context: &CouncilContext,
        strategy: CouncilStrategy,
    ) -> Result<CouncilResult, CouncilError> {
        log::debug!(
            "council run: strategy={} roles={} query_len={}",
            strategy.name(),
            self.roles.len(),
            context.query.len()
        );
        match strategy {
            CouncilStrategy::Consensus => self.consensus(context).await,
            CouncilStrategy::Deliberate { rounds } => self.deliberate(context, rounds).await,
            CouncilStrategy::Critic => self.critic(context).await,
        }
    }

    /// Fan out every role concurrently, then synthesize.
    async fn consensus(&self, context: &CouncilContext) -> Result<CouncilResult, CouncilError> {
        let panel = try_join_all(
            self.roles
                .iter()
                .map(|role| self.call_role(role, context, None)),
        )
        .await?;

        self.synthesize(context, panel, CouncilStrategy::Consensus.name())
            .await
    }

    /// Run `rounds` passes over the panel. Roles within a round run
    /// concurrently; from the second round on each role's prompt carries
    /// the full accumulated notes of every earlier round.
    async fn deliberate(
        &self,
        context: &CouncilContext,
        rounds: usize,
    ) -> Result<CouncilResult, CouncilError> {
        let rounds = rounds.max(1);
        let mut panel: Vec<CouncilNote> = Vec::new();

        for round in 0..rounds {
            let previous = if round == 0 {
                None
            } else {
                Some(format_panel(&panel))
            };
            let round_notes = try_join_all(
                self.roles
                    .iter()
                    .map(|role| self.call_role(role, context, previous.as_deref())),
            )
            .await?;
            panel.extend(round_notes);
        }

        self.synthesize(context, panel, CouncilStrategy::Deliberate { rounds }.name())
            .await
    }

    /// Consensus plus one critic pass over the panel's notes and the
    /// provisional answer.
    ///
    /// The critic call is best-effort: on failure the provisional result
    /// is returned unchanged and the failure is only logged.
    async fn critic(&self, context: &CouncilContext) -> Result<CouncilResult, CouncilError> {
        let mut result = self.consensus(context).await?;
        result.strategy = CouncilStrategy::Critic.name().to_string();

        let critic_role = CouncilRole::new("critic", RoleKind::Critic);
        let review_prompt = format!(
            "QUESTION:\n{}\n\nPANEL NOTES TO REVIEW:\n\n{}\n\nDRAFT ANSWER:\n{}\n\n\
             Review the panel's notes and the draft: challenge weak claims, \
             flag uncited or under-cited statements, and list open questions.",
            context.query,
            format_panel(&result.panel),
            result.final_answer
        );

        let review_context = CouncilContext {
            query: review_prompt,
            retrieved_context: context.retrieved_context.clone(),
            org_name: context.org_name.clone(),
        };
        match self.call_role(&critic_role, &review_context, None).await {
            Ok(note) => {
                // The critique lands in the panel; the synthesized answer
                // is never revised by it.
                result.total_tokens_in += note.tokens_used.prompt_tokens;
                result.total_tokens_out += note.tokens_used.completion_tokens;
                merge_citations(&mut result.all_citations, &note.citations);
                result.panel.push(note);
            }
            Err(e) => {
                log::warn!("critic pass failed, returning provisional answer: {}", e);
            }
        }

        Ok(result)
    }

    async fn call_role(
        &self,
        role: &CouncilRole,
        context: &CouncilContext,
        previous_notes: Option<&str>,
    ) -> Result<CouncilNote, CouncilError> {
        let mut system = role.system_prompt.clone().unwrap_or_else(|| {
            build_role_prompt(
                role.kind.as_str(),
                &context.org_name,
                context.retrieved_context.as_deref(),
            )
        });
        if let Some(notes) = previous_notes {
            system.push_str(&format!("\n\nPREVIOUS ROUND NOTES:\n{}", notes));
        }

        let response = self
            .client
            .chat(
                &[
                    ChatMessage::system(system),
                    ChatMessage::user(context.query.clone()),
                ],
                &ChatOptions::default(),
            )
            .await
            .map_err(|source| CouncilError::RoleCall {
                role: role.name.clone(),
                source,
            })?;

        let citations = parse_citations(&response.content);
        Ok(CouncilNote {
            role: role.name.clone(),
            notes: response.content,
            citations,
            tokens_used: response.usage,
        })
    }

    /// Merge panel notes into the final answer and total the accounting.
    async fn synthesize(
        &self,
        context: &CouncilContext,
        panel: Vec<CouncilNote>,
        strategy: &str,
    ) -> Result<CouncilResult, CouncilError> {
        let system = format!(
            "You are the Synthesizer for {}. Merge the council's notes into \
             one coherent, well-cited answer. Note any contradictions between \
             the panelists explicitly. Preserve every citation marker \
             [CIT:doc_id:chunk_ix] exactly as written and never invent new ones.",
            context.org_name
        );
        let user = format!(
            "QUESTION:\n{}\n\nPANEL NOTES:\n\n{}\n\n\
             Produce the final answer with inline citations.",
            context.query,
            format_panel(&panel)
        );

        let response = self
            .client
            .chat(
                &[ChatMessage::system(system), ChatMessage::user(user)],
                &ChatOptions::default(),
            )
            .await?;

        let mut total_tokens_in = response.usage.prompt_tokens;
        let mut total_tokens_out = response.usage.completion_tokens;
        for note in &panel {
            total_tokens_in += note.tokens_used.prompt_tokens;
            total_tokens_out += note.tokens_used.completion_tokens;
        }

        // The union is over panel notes only; markers appearing solely in
        // the synthesized answer are not sources the panel produced.
        let mut all_citations = Vec::new();
        for note in &panel {
            merge_citations(&mut all_citations, &note.citations);
        }

        Ok(CouncilResult {
            final_answer: response.content,
            panel,
            all_citations,
            total_tokens_in,
            total_tokens_out,
            strategy: strategy.to_string(),
        })
    }
}

/// Render panel notes for re-embedding into prompts.
fn format_panel(panel: &[CouncilNote]) -> String {
    panel
        .iter()
        .map(|note| format!("{}:\n{}", note.role, note.notes))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

/// Append `incoming` citations not already present, keeping first-seen
/// order across the whole run.
fn merge_citations(into: &mut Vec<Citation>, incoming: &[Citation]) {
    for citation in incoming {
        if !into.iter().any(|c| c.key() == citation.key()) {
            into.push(citation.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::ChatResponse;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Scripted backend: answers from a closure over the message list and
    /// records every call for ordering assertions.
    struct ScriptedClient<F> {
        respond: F,
        calls: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl<F> ScriptedClient<F>
    where
        F: Fn(&[ChatMessage]) -> Result<ChatResponse, LlmError> + Send + Sync,
    {
        fn new(respond: F) -> Self {
            Self {
                respond,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Vec<ChatMessage>> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl<F> ChatCompletion for ScriptedClient<F>
    where
        F: Fn(&[ChatMessage]) -> Result<ChatResponse, LlmError> + Send + Sync,
    {
        async fn chat(
            &self,
            messages: &[ChatMessage],
            _options: &ChatOptions,
        ) -> Result<ChatResponse, LlmError> {
            self.calls.lock().push(messages.to_vec());
            (self.respond)(messages)
        }
    }

    fn usage(prompt: u32, completion: u32) -> Usage {
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    }

    fn is_synthesis(messages: &[ChatMessage]) -> bool {
        messages.iter().any(|m| m.content.contains("PANEL NOTES:"))
    }

    fn context() -> CouncilContext {
        CouncilContext {
            query: "What is the refund policy?".to_string(),
            retrieved_context: Some("Document 1 [CIT:doc1:0]:\nTitle: Refunds\nContent: 30 days."
                .to_string()),
            org_name: "Acme".to_string(),
        }
    }

    #[tokio::test]
    async fn test_consensus_token_accounting() {
        let client = Arc::new(ScriptedClient::new(|messages: &[ChatMessage]| {
            if is_synthesis(messages) {
                Ok(ChatResponse {
                    content: "final [CIT:doc1:0]".to_string(),
                    usage: usage(50, 20),
                })
            } else {
                Ok(ChatResponse {
                    content: "note [CIT:doc1:0]".to_string(),
                    usage: usage(10, 5),
                })
            }
        }));
        let council = Council::new(client);

        let result = council
            .run(&context(), CouncilStrategy::Consensus)
            .await
            .unwrap();

        // 3 role calls at 10/5 plus one synthesis at 50/20.
        assert_eq!(result.total_tokens_in, 80);
        assert_eq!(result.total_tokens_out, 35);
        assert_eq!(result.panel.len(), 3);
        assert_eq!(result.strategy, "consensus");
        assert_eq!(result.final_answer, "final [CIT:doc1:0]");
    }

    #[tokio::test]
    async fn test_consensus_panel_keeps_role_order() {
        let client = Arc::new(ScriptedClient::new(|_: &[ChatMessage]| {
            Ok(ChatResponse {
                content: "note".to_string(),
                usage: usage(1, 1),
            })
        }));
        let council = Council::new(client);

        let result = council
            .run(&context(), CouncilStrategy::Consensus)
            .await
            .unwrap();
        let roles: Vec<&str> = result.panel.iter().map(|n| n.role.as_str()).collect();
        assert_eq!(roles, vec!["researcher", "analyst", "editor"]);
    }

    #[tokio::test]
    async fn test_consensus_aborts_on_role_failure() {
        let client = Arc::new(ScriptedClient::new(|messages: &[ChatMessage]| {
            if messages.iter().any(|m| m.content.contains("Analyst for")) {
                Err(LlmError::Api {
                    status: 400,
                    message: "bad request".to_string(),
                })
            } else {
                Ok(ChatResponse {
                    content: "note".to_string(),
                    usage: usage(1, 1),
                })
            }
        }));
        let council = Council::new(client);

        let err = council
            .run(&context(), CouncilStrategy::Consensus)
            .await
            .unwrap_err();
        match err {
            CouncilError::RoleCall { role, .. } => assert_eq!(role, "analyst"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_deliberate_rounds_gate_on_previous_notes() {
        let client = Arc::new(ScriptedClient::new(|messages: &[ChatMessage]| {
            if is_synthesis(messages) {
                Ok(ChatResponse {
                    content: "final".to_string(),
                    usage: usage(1, 1),
                })
            } else {
                Ok(ChatResponse {
                    content: "ROUND-NOTE-TEXT".to_string(),
                    usage: usage(1, 1),
                })
            }
        }));
        let council = Council::new(client.clone());

        let result = council
            .run(&context(), CouncilStrategy::Deliberate { rounds: 2 })
            .await
            .unwrap();

        // Two rounds of three roles, then synthesis.
        assert_eq!(result.panel.len(), 6);
        let calls = client.calls();
        assert_eq!(calls.len(), 7);

        // Round 0 prompts carry no prior notes; round 1 system prompts
        // carry the accumulated round-0 notes verbatim, while the user
        // turn stays the bare query.
        for call in &calls[..3] {
            assert!(!call.iter().any(|m| m.content.contains("PREVIOUS ROUND NOTES")));
        }
        for call in &calls[3..6] {
            let system = &call[0].content;
            assert!(system.contains("PREVIOUS ROUND NOTES"));
            assert!(system.contains("ROUND-NOTE-TEXT"));
            assert!(system.contains("researcher:"));
            assert_eq!(call[1].content, "What is the refund policy?");
        }
        assert!(is_synthesis(&calls[6]));
        assert_eq!(result.strategy, "deliberate");
    }

    #[tokio::test]
    async fn test_deliberate_zero_rounds_runs_one() {
        let client = Arc::new(ScriptedClient::new(|_: &[ChatMessage]| {
            Ok(ChatResponse {
                content: "note".to_string(),
                usage: usage(1, 1),
            })
        }));
        let council = Council::new(client);

        let result = council
            .run(&context(), CouncilStrategy::Deliberate { rounds: 0 })
            .await
            .unwrap();
        assert_eq!(result.panel.len(), 3);
    }

    #[tokio::test]
    async fn test_critic_note_joins_panel_on_success() {
        let client = Arc::new(ScriptedClient::new(|messages: &[ChatMessage]| {
            if messages.iter().any(|m| m.content.contains("Critic for")) {
                Ok(ChatResponse {
                    content: "weak claim at [CIT:doc2:1]".to_string(),
                    usage: usage(7, 3),
                })
            } else if is_synthesis(messages) {
                Ok(ChatResponse {
                    content: "provisional [CIT:doc1:0]".to_string(),
                    usage: usage(50, 20),
                })
            } else {
                Ok(ChatResponse {
                    content: "panel-insight [CIT:doc1:0]".to_string(),
                    usage: usage(10, 5),
                })
            }
        }));
        let council = Council::new(client.clone());

        let result = council.run(&context(), CouncilStrategy::Critic).await.unwrap();

        // The critic reviews the whole panel plus the draft answer.
        let calls = client.calls();
        let critic_call = calls
            .iter()
            .find(|c| c.iter().any(|m| m.content.contains("Critic for")))
            .expect("no critic call recorded");
        let review = &critic_call[1].content;
        assert!(review.contains("PANEL NOTES TO REVIEW:"));
        assert!(review.contains("panel-insight"));
        assert!(review.contains("researcher:"));
        assert!(review.contains("DRAFT ANSWER:\nprovisional [CIT:doc1:0]"));
        // The synthesized answer is never revised by the critique.
        assert_eq!(result.final_answer, "provisional [CIT:doc1:0]");
        assert_eq!(result.panel.len(), 4);
        assert_eq!(result.panel[3].role, "critic");
        assert_eq!(result.total_tokens_in, 80 + 7);
        assert_eq!(result.total_tokens_out, 35 + 3);
        assert!(result
            .all_citations
            .iter()
            .any(|c| c.doc_id == "doc2" && c.chunk_index == 1));
        assert_eq!(result.strategy, "critic");
    }

    #[tokio::test]
    async fn test_critic_failure_degrades_to_provisional() {
        let client = Arc::new(ScriptedClient::new(|messages: &[ChatMessage]| {
            if messages.iter().any(|m| m.content.contains("Critic for")) {
                Err(LlmError::Api {
                    status: 500,
                    message: "upstream down".to_string(),
                })
            } else if is_synthesis(messages) {
                Ok(ChatResponse {
                    content: "provisional [CIT:doc1:0]".to_string(),
                    usage: usage(50, 20),
                })
            } else {
                Ok(ChatResponse {
                    content: "note".to_string(),
                    usage: usage(10, 5),
                })
            }
        }));
        let council = Council::new(client);

        let result = council.run(&context(), CouncilStrategy::Critic).await.unwrap();
        // Provisional answer survives untouched; no critic panel entry.
        assert_eq!(result.final_answer, "provisional [CIT:doc1:0]");
        assert_eq!(result.panel.len(), 3);
        assert_eq!(result.total_tokens_in, 80);
        assert_eq!(result.total_tokens_out, 35);
    }

    #[tokio::test]
    async fn test_citations_aggregate_panel_only_first_seen() {
        let client = Arc::new(ScriptedClient::new(|messages: &[ChatMessage]| {
            let content = if messages.iter().any(|m| m.content.contains("Researcher for")) {
                "found [CIT:aaa:0] and [CIT:bbb:1]"
            } else if is_synthesis(messages) {
                "final [CIT:bbb:1] plus [CIT:ccc:2]"
            } else {
                "agrees with [CIT:aaa:0]"
            };
            Ok(ChatResponse {
                content: content.to_string(),
                usage: usage(1, 1),
            })
        }));
        let council = Council::new(client);

        let result = council
            .run(&context(), CouncilStrategy::Consensus)
            .await
            .unwrap();
        let keys: Vec<(String, u32)> = result
            .all_citations
            .iter()
            .map(|c| (c.doc_id.clone(), c.chunk_index))
            .collect();
        // Union over the panel's notes only: [CIT:ccc:2] appears solely
        // in the synthesized answer and must not be aggregated.
        assert_eq!(
            keys,
            vec![("aaa".to_string(), 0), ("bbb".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn test_synthesis_failure_propagates() {
        let client = Arc::new(ScriptedClient::new(|messages: &[ChatMessage]| {
            if is_synthesis(messages) {
                Err(LlmError::InvalidResponse("truncated".to_string()))
            } else {
                Ok(ChatResponse {
                    content: "note".to_string(),
                    usage: usage(1, 1),
                })
            }
        }));
        let council = Council::new(client);

        let err = council
            .run(&context(), CouncilStrategy::Consensus)
            .await
            .unwrap_err();
        assert!(matches!(err, CouncilError::Synthesis(_)));
    }

    #[test]
    fn test_custom_role_prompt_is_used() {
        let role = CouncilRole::new("legal", RoleKind::Custom)
            .with_system_prompt("You are outside counsel.");
        assert_eq!(role.system_prompt.as_deref(), Some("You are outside counsel."));
        assert_eq!(role.kind.as_str(), "custom");
    }
}
