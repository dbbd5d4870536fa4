//! Bounded conversation window.
//!
//! Trimming only ever removes messages; it never edits one. Compression
//! replaces the oldest block with a single summary message, or leaves the
//! history untouched when summarization fails.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ContextConfig, ContextStrategy};
use crate::context::summarizer::ContextSummarizer;
use crate::types::{ConversationMessage, Role};

/// Minimum number of old messages worth summarizing.
pub const MIN_MESSAGES_TO_COMPRESS: usize = 4;

/// Result of trimming a history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrimmedHistory {
    pub messages: Vec<ConversationMessage>,
    pub removed: usize,
    pub total_tokens: usize,
}

/// Result of a compression attempt that changed the history.
#[derive(Debug, Clone)]
pub struct Compression {
    pub messages: Vec<ConversationMessage>,
    pub messages_summarized: usize,
    /// User turns folded into the summary.
    pub rounds_summarized: usize,
    pub tokens_saved: usize,
}

pub fn total_tokens(messages: &[ConversationMessage]) -> usize {
    messages.iter().map(|m| m.token_count).sum()
}

/// Drop assistant messages at the head of a slice so it starts on a user turn.
fn start_on_user(messages: &[ConversationMessage]) -> &[ConversationMessage] {
    let start = messages
        .iter()
        .position(|m| m.role != Role::Assistant)
        .unwrap_or(messages.len());
    &messages[start..]
}

/// Applies the configured trimming strategy and compression policy.
#[derive(Debug, Clone)]
pub struct ContextWindowManager {
    config: ContextConfig,
}

impl ContextWindowManager {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Split into (preserved system messages, conversation messages).
    fn partition(
        &self,
        messages: &[ConversationMessage],
    ) -> (Vec<ConversationMessage>, Vec<ConversationMessage>) {
        if self.config.preserve_system_prompt {
            messages.iter().cloned().partition(|m| m.role == Role::System)
        } else {
            (Vec::new(), messages.to_vec())
        }
    }

    /// Trim according to the configured strategy.
    pub fn trim(&self, messages: &[ConversationMessage]) -> TrimmedHistory {
        self.trim_within(messages, self.config.max_rounds * 2, self.config.max_tokens)
    }

    /// Trim the history that precedes `question` so that history plus
    /// question fits the window. The question takes one message slot and its
    /// tokens come off the budget first; it is never dropped itself, so the
    /// returned history may be empty.
    pub fn trim_for_turn(
        &self,
        history: &[ConversationMessage],
        question: &ConversationMessage,
    ) -> TrimmedHistory {
        self.trim_within(
            history,
            (self.config.max_rounds * 2).saturating_sub(1),
            self.config.max_tokens.saturating_sub(question.token_count),
        )
    }

    fn trim_within(
        &self,
        messages: &[ConversationMessage],
        message_limit: usize,
        token_budget: usize,
    ) -> TrimmedHistory {
        let kept = match self.config.strategy {
            ContextStrategy::SlidingWindow => self.window_of(messages, message_limit),
            ContextStrategy::TokenLimit => self.within_budget(messages, token_budget),
            ContextStrategy::Hybrid => {
                self.within_budget(&self.window_of(messages, message_limit), token_budget)
            }
        };
        let removed = messages.len().saturating_sub(kept.len());
        if removed > 0 {
            debug!(
                strategy = %self.config.strategy,
                removed,
                kept = kept.len(),
                "Conversation history trimmed"
            );
        }
        TrimmedHistory {
            total_tokens: total_tokens(&kept),
            removed,
            messages: kept,
        }
    }

    /// Keep preserved system messages plus the last `2 × max_rounds`
    /// conversation messages, starting on a user turn.
    pub fn sliding_window(&self, messages: &[ConversationMessage]) -> Vec<ConversationMessage> {
        self.window_of(messages, self.config.max_rounds * 2)
    }

    fn window_of(&self, messages: &[ConversationMessage], limit: usize) -> Vec<ConversationMessage> {
        let (mut system, conversation) = self.partition(messages);

        let window = if conversation.len() > limit {
            &conversation[conversation.len() - limit..]
        } else {
            &conversation[..]
        };
        system.extend_from_slice(start_on_user(window));
        system
    }

    /// Keep the most recent messages whose estimated tokens fit `max_tokens`.
    ///
    /// Preserved system messages are budgeted first (oldest dropped if they
    /// alone overflow), then conversation messages are taken newest first until
    /// the next one would not fit. The result starts on a user turn.
    pub fn token_limit(&self, messages: &[ConversationMessage]) -> Vec<ConversationMessage> {
        self.within_budget(messages, self.config.max_tokens)
    }

    fn within_budget(&self, messages: &[ConversationMessage], budget: usize) -> Vec<ConversationMessage> {
        let (system, conversation) = self.partition(messages);

        let mut system_tokens = total_tokens(&system);
        let mut system_start = 0;
        while system_tokens > budget && system_start < system.len() {
            system_tokens -= system[system_start].token_count;
            system_start += 1;
        }

        let mut used = system_tokens;
        let mut start = conversation.len();
        for (i, msg) in conversation.iter().enumerate().rev() {
            if used + msg.token_count > budget {
                break;
            }
            used += msg.token_count;
            start = i;
        }

        let mut kept = system[system_start..].to_vec();
        kept.extend_from_slice(start_on_user(&conversation[start..]));
        kept
    }

    /// Number of completed user turns in the history.
    pub fn rounds(messages: &[ConversationMessage]) -> usize {
        messages.iter().filter(|m| m.role == Role::User).count()
    }

    /// Whether compression should be attempted before the next turn.
    pub fn needs_compression(&self, messages: &[ConversationMessage]) -> bool {
        if !self.config.compression_enabled {
            return false;
        }
        let conversation = messages.iter().filter(|m| m.role != Role::System).count();
        Self::rounds(messages) >= self.config.compress_after_rounds
            && conversation.saturating_sub(self.config.keep_recent) >= MIN_MESSAGES_TO_COMPRESS
    }

    /// Replace all but the last `keep_recent` conversation messages (and any
    /// earlier summary) with one summary message.
    ///
    /// Returns `None` when there is too little to compress or summarization
    /// fails; the caller keeps its history as is.
    pub async fn compress(
        &self,
        messages: &[ConversationMessage],
        summarizer: &ContextSummarizer,
    ) -> Option<Compression> {
        let (pinned, rest): (Vec<_>, Vec<_>) = messages
            .iter()
            .cloned()
            .partition(|m| m.role == Role::System && !m.is_summary);

        let keep = self.config.keep_recent.min(rest.len());
        let split = rest.len() - keep;
        let (old, recent) = rest.split_at(split);
        let old_conversation = old.iter().filter(|m| !m.is_summary).count();
        let rounds_summarized = old.iter().filter(|m| m.role == Role::User).count();
        if old_conversation < MIN_MESSAGES_TO_COMPRESS {
            return None;
        }

        match summarizer.summarize(old).await {
            Ok(summary) => {
                let mut compressed = pinned;
                compressed.push(ConversationMessage::summary(format!(
                    "Summary of the earlier conversation: {}",
                    summary.text
                )));
                compressed.extend_from_slice(recent);
                info!(
                    summarized = summary.messages_summarized,
                    tokens_saved = summary.tokens_saved,
                    "Conversation compressed"
                );
                Some(Compression {
                    messages: compressed,
                    messages_summarized: summary.messages_summarized,
                    rounds_summarized,
                    tokens_saved: summary.tokens_saved,
                })
            }
            Err(e) => {
                warn!(error = %e, "Compression failed, history left untouched");
                None
            }
        }
    }
}
