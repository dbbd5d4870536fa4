//! Intent analysis: decides whether a turn needs retrieval.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::llm_json::{parse_json, truncate_chars};
use crate::provider::CompletionProvider;
use crate::types::{ConversationMessage, DecisionKind, OrchestratorDecision, Role};

/// Opening line of the routing prompt.
pub const INTENT_PROMPT_HEADER: &str = "You route questions for a retrieval-augmented assistant.";

/// History messages shown to the analyzer.
const HISTORY_WINDOW: usize = 4;

const SMALL_TALK_PHRASES: &[&str] = &[
    "hi",
    "hello",
    "hey",
    "hiya",
    "yo",
    "howdy",
    "greetings",
    "good morning",
    "good afternoon",
    "good evening",
    "thanks",
    "thank you",
    "thanks a lot",
    "thank you very much",
    "thx",
    "ty",
    "cheers",
    "bye",
    "goodbye",
    "see you",
    "ok",
    "okay",
    "how are you",
    "你好",
    "您好",
    "嗨",
    "哈喽",
    "早上好",
    "晚上好",
    "谢谢",
    "多谢",
    "感谢",
    "再见",
    "拜拜",
];

/// Trailing words allowed after a greeting ("hi there", "thanks so much").
const SMALL_TALK_FILLERS: &[&str] = &["there", "so", "much", "all", "again", "everyone", "friend"];

fn normalise(query: &str) -> String {
    query
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() || c == '\'' {
                c
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether `query` is a pure greeting, thanks or farewell.
pub fn is_small_talk(query: &str) -> bool {
    let normalised = normalise(query);
    if normalised.is_empty() {
        return false;
    }
    if SMALL_TALK_PHRASES.contains(&normalised.as_str()) {
        return true;
    }
    SMALL_TALK_PHRASES.iter().any(|phrase| {
        normalised
            .strip_prefix(phrase)
            .filter(|rest| rest.starts_with(' '))
            .is_some_and(|rest| {
                rest.split_whitespace()
                    .all(|w| SMALL_TALK_FILLERS.contains(&w))
            })
    })
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    action: DecisionKind,
    #[serde(default)]
    intent: String,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    needs_retrieval: Option<bool>,
    #[serde(default)]
    search_query: Option<String>,
}

impl RawDecision {
    fn into_decision(self, query: &str) -> OrchestratorDecision {
        let needs_retrieval = self
            .needs_retrieval
            .unwrap_or(self.action == DecisionKind::ToolCall);
        let kind = match (needs_retrieval, self.action) {
            (true, _) => DecisionKind::ToolCall,
            (false, DecisionKind::ToolCall) => DecisionKind::Generate,
            (false, other) => other,
        };
        let search_query = needs_retrieval.then(|| {
            self.search_query
                .map(|q| q.trim().to_string())
                .filter(|q| !q.is_empty())
                .unwrap_or_else(|| query.to_string())
        });
        OrchestratorDecision {
            kind,
            intent: if self.intent.trim().is_empty() {
                "unspecified".to_string()
            } else {
                self.intent.trim().to_string()
            },
            confidence: self
                .confidence
                .filter(|c| c.is_finite())
                .unwrap_or(0.5)
                .clamp(0.0, 1.0),
            needs_retrieval,
            search_query,
        }
    }
}

/// Classifies a turn with a fast model.
pub struct IntentAnalyzer {
    llm: Arc<dyn CompletionProvider>,
    temperature: f32,
}

impl IntentAnalyzer {
    pub fn new(llm: Arc<dyn CompletionProvider>) -> Self {
        Self {
            llm,
            temperature: 0.0,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn build_prompt(query: &str, history: &[ConversationMessage]) -> String {
        let mut prompt = format!(
            "{INTENT_PROMPT_HEADER}\n\
             Decide how to handle the user's message. Use \"tool_call\" when answering \
             needs documents from the knowledge base, \"generate\" for chit-chat or \
             questions answerable without documents, and \"clarify\" when the request \
             is too ambiguous to act on. Respond with JSON only:\n\
             {{\"action\": \"tool_call|generate|clarify\", \"intent\": \"<short label>\", \
             \"confidence\": <0-1>, \"needs_retrieval\": <true|false>, \
             \"search_query\": \"<query for the knowledge base>\"}}\n\n"
        );
        let recent: Vec<_> = history
            .iter()
            .filter(|m| m.role != Role::System || m.is_summary)
            .collect();
        let start = recent.len().saturating_sub(HISTORY_WINDOW);
        if start < recent.len() {
            prompt.push_str("Recent conversation:\n");
            for msg in &recent[start..] {
                prompt.push_str(&format!(
                    "{}: {}\n",
                    msg.role,
                    truncate_chars(&msg.content, 300)
                ));
            }
            prompt.push('\n');
        }
        prompt.push_str(&format!("Message: {query}"));
        prompt
    }

    /// Analyze `query`.
    ///
    /// Greetings without history short-circuit without a model call.
    /// Unparseable output defaults to retrieval; provider failures are
    /// returned so the caller can record them before defaulting.
    pub async fn analyze(
        &self,
        query: &str,
        history: &[ConversationMessage],
    ) -> Result<OrchestratorDecision, ProviderError> {
        if history.is_empty() && is_small_talk(query) {
            debug!(query, "Small talk detected, retrieval not needed");
            return Ok(OrchestratorDecision::small_talk());
        }

        let prompt = Self::build_prompt(query, history);
        let raw = self.llm.complete(&prompt, self.temperature).await?;
        match parse_json::<RawDecision>(&raw) {
            Some(parsed) => {
                let decision = parsed.into_decision(query);
                debug!(
                    kind = %decision.kind,
                    intent = %decision.intent,
                    confidence = decision.confidence,
                    "Intent analyzed"
                );
                Ok(decision)
            }
            None => {
                warn!("Unparseable intent analysis, defaulting to retrieval");
                Ok(OrchestratorDecision::default_retrieve(query))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockCompletionProvider;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_small_talk_detection() {
        for q in ["hi", "Hello!", "hi there", "Thanks so much!", "谢谢", "你好！", "good morning"] {
            assert!(is_small_talk(q), "{q} should be small talk");
        }
        for q in ["hi, what is BM25?", "thanks, but how does RRF work", "", "history of hello kitty"] {
            assert!(!is_small_talk(q), "{q} should not be small talk");
        }
    }

    #[tokio::test]
    async fn test_small_talk_skips_model() {
        let llm = Arc::new(MockCompletionProvider::new());
        let analyzer = IntentAnalyzer::new(llm.clone());
        let decision = analyzer.analyze("hi", &[]).await.unwrap();
        assert!(!decision.needs_retrieval);
        assert_eq!(decision.kind, DecisionKind::Generate);
        assert!(llm.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_greeting_with_history_consults_model() {
        let llm = Arc::new(MockCompletionProvider::new().on(
            INTENT_PROMPT_HEADER,
            r#"{"action": "generate", "intent": "thanks", "confidence": 0.9, "needs_retrieval": false}"#,
        ));
        let analyzer = IntentAnalyzer::new(llm.clone());
        let history = vec![ConversationMessage::user("what is rrf?")];
        let decision = analyzer.analyze("thanks", &history).await.unwrap();
        assert_eq!(decision.kind, DecisionKind::Generate);
        assert_eq!(llm.prompts().len(), 1);
        assert!(llm.prompts()[0].contains("user: what is rrf?"));
    }

    #[tokio::test]
    async fn test_tool_call_decision() {
        let llm = Arc::new(MockCompletionProvider::new().on(
            INTENT_PROMPT_HEADER,
            "```json\n{\"action\": \"tool_call\", \"intent\": \"definition\", \"confidence\": 0.92, \"search_query\": \"reciprocal rank fusion\"}\n```",
        ));
        let decision = IntentAnalyzer::new(llm)
            .analyze("What is RRF?", &[])
            .await
            .unwrap();
        assert_eq!(
            decision,
            OrchestratorDecision {
                kind: DecisionKind::ToolCall,
                intent: "definition".to_string(),
                confidence: 0.92,
                needs_retrieval: true,
                search_query: Some("reciprocal rank fusion".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_needs_retrieval_overrides_action() {
        let llm = Arc::new(MockCompletionProvider::new().on(
            INTENT_PROMPT_HEADER,
            r#"{"action": "generate", "needs_retrieval": true, "confidence": 7}"#,
        ));
        let decision = IntentAnalyzer::new(llm)
            .analyze("Explain BM25", &[])
            .await
            .unwrap();
        assert_eq!(decision.kind, DecisionKind::ToolCall);
        assert_eq!(decision.search_query.as_deref(), Some("Explain BM25"));
        assert_eq!(decision.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_clarify_decision() {
        let llm = Arc::new(MockCompletionProvider::new().on(
            INTENT_PROMPT_HEADER,
            r#"{"action": "clarify", "intent": "ambiguous", "confidence": 0.6}"#,
        ));
        let decision = IntentAnalyzer::new(llm).analyze("that thing", &[]).await.unwrap();
        assert_eq!(decision.kind, DecisionKind::Clarify);
        assert!(!decision.needs_retrieval);
        assert!(decision.search_query.is_none());
    }

    #[tokio::test]
    async fn test_unparseable_defaults_to_retrieve() {
        let llm = Arc::new(MockCompletionProvider::with_response("I think you should search."));
        let decision = IntentAnalyzer::new(llm)
            .analyze("What is HNSW?", &[])
            .await
            .unwrap();
        assert_eq!(decision, OrchestratorDecision::default_retrieve("What is HNSW?"));
    }

    #[tokio::test]
    async fn test_provider_error_is_returned() {
        let llm = MockCompletionProvider::new();
        llm.queue_error(ProviderError::Timeout { timeout_secs: 5 });
        let result = IntentAnalyzer::new(Arc::new(llm))
            .analyze("What is HNSW?", &[])
            .await;
        assert!(matches!(result, Err(ProviderError::Timeout { .. })));
    }
}
