//! Judge-model reranking of fused candidates.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::llm_json::{parse_score, truncate_chars};
use crate::provider::CompletionProvider;
use crate::types::RetrievedDocument;

/// Opening line of the rerank prompt.
pub const RERANK_PROMPT_HEADER: &str = "Rate how relevant the document is to the query.";

/// Reorders fused candidates and keeps the best `top_k`.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        documents: Vec<RetrievedDocument>,
        top_k: usize,
    ) -> Vec<RetrievedDocument>;
}

/// Scores every candidate concurrently with a judge model.
///
/// A candidate whose score cannot be obtained keeps its fused score rather
/// than being dropped.
pub struct LlmReranker {
    judge: Arc<dyn CompletionProvider>,
    temperature: f32,
    max_document_chars: usize,
}

impl LlmReranker {
    pub fn new(judge: Arc<dyn CompletionProvider>) -> Self {
        Self {
            judge,
            temperature: 0.0,
            max_document_chars: 1000,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn build_prompt(&self, query: &str, document: &RetrievedDocument) -> String {
        format!(
            "{RERANK_PROMPT_HEADER}\n\
             Respond with JSON only: {{\"score\": <number between 0 and 1>}}\n\n\
             <query>{}</query>\n\
             <document>{}</document>",
            query,
            truncate_chars(&document.content, self.max_document_chars)
        )
    }

    async fn score_one(&self, query: &str, document: &RetrievedDocument) -> Option<f32> {
        let prompt = self.build_prompt(query, document);
        match self.judge.complete(&prompt, self.temperature).await {
            Ok(raw) => {
                let score = parse_score(&raw);
                if score.is_none() {
                    warn!(document_id = %document.id, "Unparseable rerank score, keeping fused score");
                }
                score
            }
            Err(e) => {
                warn!(document_id = %document.id, error = %e, "Rerank call failed, keeping fused score");
                None
            }
        }
    }
}

#[async_trait]
impl Reranker for LlmReranker {
    async fn rerank(
        &self,
        query: &str,
        documents: Vec<RetrievedDocument>,
        top_k: usize,
    ) -> Vec<RetrievedDocument> {
        if documents.is_empty() {
            return documents;
        }

        let pending: Vec<_> = documents
            .iter()
            .map(|doc| self.score_one(query, doc))
            .collect();
        let scores = futures::future::join_all(pending).await;

        let mut reranked: Vec<RetrievedDocument> = documents
            .into_iter()
            .zip(scores)
            .map(|(mut doc, score)| {
                doc.rerank_score = score;
                doc
            })
            .collect();

        reranked.sort_by(|a, b| b.effective_score().total_cmp(&a.effective_score()));
        reranked.truncate(top_k);
        debug!(kept = reranked.len(), "Rerank complete");
        reranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::MockCompletionProvider;
    use crate::types::DocumentSource;

    fn doc(id: &str, content: &str, score: f32) -> RetrievedDocument {
        RetrievedDocument::new(id, content, score, DocumentSource::Hybrid)
    }

    #[tokio::test]
    async fn test_rerank_sorts_by_judge_score() {
        let judge = MockCompletionProvider::new()
            .on("<document>alpha", "{\"score\": 0.2}")
            .on("<document>beta", "{\"score\": 0.9}")
            .on("<document>gamma", "{\"score\": 0.5}");
        let reranker = LlmReranker::new(Arc::new(judge));
        let docs = vec![
            doc("a", "alpha text", 0.016),
            doc("b", "beta text", 0.015),
            doc("c", "gamma text", 0.014),
        ];
        let out = reranker.rerank("q", docs, 3).await;
        let ids: Vec<_> = out.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert_eq!(out[0].rerank_score, Some(0.9));
    }

    #[tokio::test]
    async fn test_rerank_truncates() {
        let judge = MockCompletionProvider::with_response("{\"score\": 0.5}");
        let reranker = LlmReranker::new(Arc::new(judge));
        let docs = (0..5).map(|i| doc(&format!("d{i}"), "x", 0.01)).collect();
        assert_eq!(reranker.rerank("q", docs, 3).await.len(), 3);
    }

    #[tokio::test]
    async fn test_failed_document_keeps_fused_score() {
        let judge = MockCompletionProvider::new()
            .on("<document>alpha", "{\"score\": 0.7}")
            .fail_on(
                "<document>beta",
                ProviderError::Timeout { timeout_secs: 5 },
            )
            .on("<document>gamma", "not a number at all, sorry about that");
        let reranker = LlmReranker::new(Arc::new(judge));
        let docs = vec![
            doc("a", "alpha", 0.016),
            doc("b", "beta", 0.015),
            doc("c", "gamma", 0.014),
        ];
        let out = reranker.rerank("q", docs, 3).await;
        assert_eq!(out.len(), 3);
        let b = out.iter().find(|d| d.id == "b").unwrap();
        assert_eq!(b.rerank_score, None);
        assert!((b.effective_score() - 0.015).abs() < f32::EPSILON);
        assert_eq!(out[0].id, "a");
    }

    #[tokio::test]
    async fn test_empty_input() {
        let reranker = LlmReranker::new(Arc::new(MockCompletionProvider::new()));
        assert!(reranker.rerank("q", Vec::new(), 3).await.is_empty());
    }
}
