//! Post-hoc answer verification.
//!
//! After an answer has been delivered, a detached task re-reads it against
//! the retrieved context. Only a severe, confident mismatch with a corrected
//! answer produces a [`CorrectionEvent`]; everything else, including every
//! failure, ends silently.

use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::VerificationConfig;
use crate::llm_json::{parse_json, truncate_chars};
use crate::provider::CompletionProvider;
use crate::types::{CorrectionEvent, RetrievedDocument};

/// Opening line of the verification prompt.
pub const VERIFY_PROMPT_HEADER: &str =
    "You are a fact checker comparing an answer against its source documents.";

const CONTEXT_DOCUMENTS: usize = 8;
const DOCUMENT_CHAR_LIMIT: usize = 800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Severity {
    None,
    Minor,
    Severe,
}

#[derive(Debug, Deserialize)]
struct Verdict {
    severity: Severity,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    unsupported_claims: Vec<String>,
    #[serde(default)]
    corrected_answer: Option<String>,
}

/// Checks delivered answers and publishes corrections.
#[derive(Clone)]
pub struct Verifier {
    llm: Arc<dyn CompletionProvider>,
    sender: broadcast::Sender<CorrectionEvent>,
    confidence_threshold: f32,
}

impl Verifier {
    pub fn new(llm: Arc<dyn CompletionProvider>, config: &VerificationConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            llm,
            sender,
            confidence_threshold: config.confidence_threshold,
        }
    }

    /// Receive corrections for answers verified after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<CorrectionEvent> {
        self.sender.subscribe()
    }

    fn build_prompt(query: &str, answer: &str, context: &[RetrievedDocument]) -> String {
        let mut prompt = format!(
            "{VERIFY_PROMPT_HEADER}\n\
             List claims in the answer that the documents do not support. Rate the \
             mismatch as \"none\", \"minor\" or \"severe\" and, if severe, write a \
             corrected answer grounded only in the documents. Respond with JSON only:\n\
             {{\"severity\": \"none|minor|severe\", \"confidence\": <0-1>, \
             \"unsupported_claims\": [\"...\"], \"corrected_answer\": \"...\"}}\n\n\
             <question>{query}</question>\n<answer>{answer}</answer>\n<documents>\n"
        );
        for doc in context.iter().take(CONTEXT_DOCUMENTS) {
            prompt.push_str(&format!(
                "[{}] {}\n",
                doc.id,
                truncate_chars(&doc.content, DOCUMENT_CHAR_LIMIT)
            ));
        }
        prompt.push_str("</documents>");
        prompt
    }

    /// Verify one answer. Returns a correction only for severe mismatches
    /// above the confidence threshold that come with a corrected answer.
    pub async fn verify(
        &self,
        query: &str,
        answer: &str,
        context: &[RetrievedDocument],
    ) -> Option<CorrectionEvent> {
        if context.is_empty() || answer.trim().is_empty() {
            debug!("Nothing to verify against, skipping");
            return None;
        }

        let prompt = Self::build_prompt(query, answer, context);
        let raw = match self.llm.complete(&prompt, 0.0).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(error = %e, "Verification call failed, ignoring");
                return None;
            }
        };
        let Some(verdict) = parse_json::<Verdict>(&raw) else {
            debug!("Unparseable verification response, ignoring");
            return None;
        };

        let corrected = verdict
            .corrected_answer
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty() && a != answer.trim());
        match corrected {
            Some(corrected_answer)
                if verdict.severity == Severity::Severe
                    && verdict.confidence > self.confidence_threshold =>
            {
                Some(CorrectionEvent {
                    query: query.to_string(),
                    original_answer: answer.to_string(),
                    corrected_answer,
                    confidence: verdict.confidence,
                    unsupported_claims: verdict.unsupported_claims,
                    created_at: Utc::now(),
                })
            }
            _ => {
                debug!(
                    severity = ?verdict.severity,
                    confidence = verdict.confidence,
                    "Answer verified, no correction"
                );
                None
            }
        }
    }

    /// Verify in a detached task and publish any correction.
    ///
    /// The handle is returned for tests; the engine drops it.
    pub fn spawn(
        &self,
        query: String,
        answer: String,
        context: Vec<RetrievedDocument>,
    ) -> JoinHandle<()> {
        let verifier = self.clone();
        tokio::spawn(async move {
            if let Some(event) = verifier.verify(&query, &answer, &context).await {
                info!(
                    confidence = event.confidence,
                    claims = event.unsupported_claims.len(),
                    "Publishing answer correction"
                );
                // No subscribers is fine.
                let _ = verifier.sender.send(event);
            }
        })
    }
}
