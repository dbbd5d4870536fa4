//! LLM-based conversation summarization.
//!
//! When a session grows past the compression point, the oldest block of
//! messages is summarized into a single system-role digest so the key facts
//! survive while the token cost shrinks.

use std::sync::Arc;

use crate::context::tokens::estimate_tokens;
use crate::error::ContextError;
use crate::provider::CompletionProvider;
use crate::types::{ConversationMessage, Role};

/// Opening line of the summarization prompt.
pub const SUMMARY_PROMPT_HEADER: &str = "Summarize the following conversation concisely";

/// Summary of conversation history produced for compression.
#[derive(Debug, Clone)]
pub struct ContextSummary {
    pub text: String,
    pub messages_summarized: usize,
    /// Estimated tokens saved.
    pub tokens_saved: usize,
}

/// Generates summaries of conversation history with a completion model.
pub struct ContextSummarizer {
    provider: Arc<dyn CompletionProvider>,
    temperature: f32,
}

impl ContextSummarizer {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self {
            provider,
            temperature: 0.3,
        }
    }

    /// Summarize `messages`. Fails rather than returning an empty digest so
    /// callers can leave history untouched.
    pub async fn summarize(
        &self,
        messages: &[ConversationMessage],
    ) -> Result<ContextSummary, ContextError> {
        if messages.is_empty() {
            return Err(ContextError::CompressionFailed {
                message: "nothing to summarize".to_string(),
            });
        }

        let prompt = build_summarization_prompt(messages);
        let text = self
            .provider
            .complete(&prompt, self.temperature)
            .await
            .map_err(|e| ContextError::CompressionFailed {
                message: e.to_string(),
            })?;
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(ContextError::CompressionFailed {
                message: "summarizer returned an empty summary".to_string(),
            });
        }

        let original_tokens: usize = messages.iter().map(|m| m.token_count).sum();
        let summary_tokens = estimate_tokens(&text);

        Ok(ContextSummary {
            messages_summarized: messages.len(),
            tokens_saved: original_tokens.saturating_sub(summary_tokens),
            text,
        })
    }
}

fn build_summarization_prompt(messages: &[ConversationMessage]) -> String {
    let mut prompt = format!(
        "{SUMMARY_PROMPT_HEADER}, preserving:\n\
         - The questions the user asked and the answers given\n\
         - Important facts, names and numbers\n\
         - Open questions the user may follow up on\n\n\
         Conversation:\n"
    );

    for msg in messages {
        let role = match msg.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System if msg.is_summary => "Earlier summary",
            Role::System => "System",
        };
        prompt.push_str(&format!("{}: {}\n", role, msg.content));
    }

    prompt.push_str("\nProvide a concise summary (3-5 sentences) capturing the essential context:");
    prompt
}
