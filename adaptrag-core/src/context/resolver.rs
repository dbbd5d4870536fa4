//! Pronoun and ellipsis resolution for follow-up questions.
//!
//! A cheap pass run by the conversation layer before a turn: "what about its
//! weights?" becomes "what are the RRF fusion weights?". It is unrelated to the
//! retrieval-retry rewrite and never runs inside the workflow.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::llm_json::{clean_line, truncate_chars};
use crate::provider::CompletionProvider;
use crate::retrieval::lexical::tokenize;
use crate::types::{ConversationMessage, Role};

/// Opening line of the resolution prompt.
pub const RESOLVE_PROMPT_HEADER: &str = "Rewrite the follow-up question so it stands alone.";

/// Queries with at most this many tokens count as elliptical.
const SHORT_QUERY_TOKENS: usize = 3;
/// History messages shown to the resolver.
const HISTORY_WINDOW: usize = 6;

const PRONOUN_LEADS: &[&str] = &[
    "it", "its", "it's", "that", "this", "they", "them", "their", "those", "these", "he", "she",
    "his", "her",
];

const ELLIPSIS_LEADS: &[&str] = &[
    "what about",
    "how about",
    "and what",
    "and how",
    "and the",
    "what else",
    "why not",
    "那",
    "这",
    "它",
    "还有",
    "那么",
];

const TOPIC_SWITCH_MARKERS: &[&str] = &[
    "by the way",
    "new question",
    "new topic",
    "another question",
    "different question",
    "unrelated",
    "change of subject",
    "换个话题",
    "另外一个问题",
    "新问题",
    "顺便问",
];

/// Whether the query explicitly changes the subject.
pub fn is_topic_switch(query: &str) -> bool {
    let lower = query.to_lowercase();
    TOPIC_SWITCH_MARKERS.iter().any(|m| lower.contains(m))
}

/// Whether the query leans on earlier turns to be understood.
pub fn is_dependent_query(query: &str) -> bool {
    let lower = query.trim().to_lowercase();
    if lower.is_empty() {
        return false;
    }
    let first_word = lower
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .find(|w| !w.is_empty())
        .unwrap_or("");
    PRONOUN_LEADS.contains(&first_word)
        || ELLIPSIS_LEADS.iter().any(|lead| lower.starts_with(lead))
        || tokenize(&lower).len() <= SHORT_QUERY_TOKENS
}

/// Whether resolution should run for `query` given `history`.
pub fn needs_resolution(query: &str, history: &[ConversationMessage]) -> bool {
    let has_prior_turn = history.iter().any(|m| m.role == Role::User);
    has_prior_turn && !is_topic_switch(query) && is_dependent_query(query)
}

/// Outcome of a resolution attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedQuery {
    pub query: String,
    pub resolved: bool,
}

impl ResolvedQuery {
    fn unchanged(query: &str) -> Self {
        Self {
            query: query.to_string(),
            resolved: false,
        }
    }
}

/// Rewrites dependent follow-ups into standalone questions.
pub struct ReferenceResolver {
    llm: Arc<dyn CompletionProvider>,
    temperature: f32,
}

impl ReferenceResolver {
    pub fn new(llm: Arc<dyn CompletionProvider>) -> Self {
        Self {
            llm,
            temperature: 0.0,
        }
    }

    fn build_prompt(query: &str, history: &[ConversationMessage]) -> String {
        let mut prompt = format!(
            "{RESOLVE_PROMPT_HEADER}\n\
             Replace pronouns and fill in omitted subjects using the conversation. \
             Keep the user's intent and language. Reply with the question only.\n\n\
             Conversation:\n"
        );
        let start = history.len().saturating_sub(HISTORY_WINDOW);
        for msg in &history[start..] {
            if msg.role == Role::System && !msg.is_summary {
                continue;
            }
            prompt.push_str(&format!(
                "{}: {}\n",
                msg.role,
                truncate_chars(&msg.content, 500)
            ));
        }
        prompt.push_str(&format!("\nFollow-up: {query}"));
        prompt
    }

    /// Resolve `query` if it needs it; otherwise, or on any failure, return
    /// it unchanged.
    pub async fn resolve(&self, query: &str, history: &[ConversationMessage]) -> ResolvedQuery {
        if !needs_resolution(query, history) {
            return ResolvedQuery::unchanged(query);
        }

        let prompt = Self::build_prompt(query, history);
        match self.llm.complete(&prompt, self.temperature).await {
            Ok(raw) => {
                let candidate = clean_line(&raw);
                if candidate.is_empty() || candidate.chars().count() > query.chars().count() * 6 + 200
                {
                    warn!("Reference resolution produced an unusable query, keeping original");
                    return ResolvedQuery::unchanged(query);
                }
                debug!(from = query, to = %candidate, "Follow-up resolved");
                ResolvedQuery {
                    resolved: candidate != query,
                    query: candidate,
                }
            }
            Err(e) => {
                warn!(error = %e, "Reference resolution failed, keeping original");
                ResolvedQuery::unchanged(query)
            }
        }
    }
}
