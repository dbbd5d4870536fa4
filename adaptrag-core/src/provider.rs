//! Model provider abstractions.
//!
//! The engine talks to models only through the [`EmbeddingProvider`] and
//! [`CompletionProvider`] traits, injected at construction time. This module
//! also carries the offline implementations: a hashed bag-of-words embedder
//! and a scriptable mock completion provider.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::ProviderError;
use crate::retrieval::lexical::tokenize;

/// Turns text into a dense vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// Embed several texts. The default implementation embeds sequentially.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Length of the vectors this provider produces.
    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;
}

/// Turns a prompt into generated text.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, prompt: &str, temperature: f32) -> Result<String, ProviderError>;

    /// Stream the completion as text chunks.
    ///
    /// Returning `Ok` means every chunk was sent. The default implementation
    /// sends the whole completion as a single chunk.
    async fn complete_streaming(
        &self,
        prompt: &str,
        temperature: f32,
        tx: mpsc::Sender<String>,
    ) -> Result<(), ProviderError> {
        let text = self.complete(prompt, temperature).await?;
        let _ = tx.send(text).await;
        Ok(())
    }

    fn model_name(&self) -> &str;
}

/// Hash function for mapping terms onto embedding dimensions (djb2).
fn simple_hash(s: &str) -> usize {
    let mut hash: usize = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as usize);
    }
    hash
}

/// Deterministic hashed bag-of-words embedder.
///
/// Needs no network or model files. Identical texts map to identical vectors
/// and texts sharing vocabulary land close together, which is enough for the
/// in-memory store, the semantic cache and tests.
#[derive(Debug, Clone)]
pub struct LocalEmbeddingProvider {
    dimension: usize,
    model: String,
}

impl LocalEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            model: format!("local-hash-{}", dimension.max(1)),
        }
    }

    pub fn with_model_name(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        let terms = tokenize(text);
        if terms.is_empty() {
            return vector;
        }

        let mut tf: HashMap<&str, usize> = HashMap::new();
        for term in &terms {
            *tf.entry(term.as_str()).or_insert(0) += 1;
        }

        for (term, count) in &tf {
            let idx = simple_hash(term) % self.dimension;
            vector[idx] += *count as f32;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(self.embed_sync(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Embedding provider that always fails. Used to exercise degradation paths.
#[derive(Debug, Clone)]
pub struct FailingEmbeddingProvider {
    dimension: usize,
    error: ProviderError,
}

impl FailingEmbeddingProvider {
    pub fn new(dimension: usize, error: ProviderError) -> Self {
        Self { dimension, error }
    }
}

#[async_trait]
impl EmbeddingProvider for FailingEmbeddingProvider {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Err(self.error.clone())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "failing-embedder"
    }
}

/// Stands in for the completion model when none could be configured.
///
/// Every call fails with the non-fatal [`ProviderError::Unavailable`], so a
/// turn still retrieves but answers with the fallback and caches nothing.
#[derive(Debug, Clone)]
pub struct UnavailableCompletionProvider {
    reason: String,
}

impl UnavailableCompletionProvider {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl CompletionProvider for UnavailableCompletionProvider {
    async fn complete(&self, _prompt: &str, _temperature: f32) -> Result<String, ProviderError> {
        Err(ProviderError::Unavailable {
            message: self.reason.clone(),
        })
    }

    fn model_name(&self) -> &str {
        "unavailable"
    }
}

#[derive(Debug, Clone)]
enum MockReply {
    Text(String),
    Fail(ProviderError),
}

impl MockReply {
    fn into_result(self) -> Result<String, ProviderError> {
        match self {
            MockReply::Text(text) => Ok(text),
            MockReply::Fail(err) => Err(err),
        }
    }
}

#[derive(Debug)]
struct MockRule {
    needle: String,
    /// Consumed front to back; the last reply repeats forever.
    replies: VecDeque<MockReply>,
}

impl MockRule {
    fn next_reply(&mut self) -> Option<MockReply> {
        if self.replies.len() > 1 {
            self.replies.pop_front()
        } else {
            self.replies.front().cloned()
        }
    }
}

/// A scriptable completion provider for tests and offline runs.
///
/// Resolution order for each call: the first rule whose needle occurs in the
/// prompt, then the FIFO queue, then the default response. Every prompt is
/// recorded so tests can assert on what was asked.
pub struct MockCompletionProvider {
    model: String,
    rules: Mutex<Vec<MockRule>>,
    queue: Mutex<VecDeque<MockReply>>,
    default_response: String,
    prompts: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl MockCompletionProvider {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            rules: Mutex::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            default_response: "I'm a mock model. No scripted response matched.".to_string(),
            prompts: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Create a provider that answers every prompt with the given text.
    pub fn with_response(text: &str) -> Self {
        let mut provider = Self::new();
        provider.default_response = text.to_string();
        provider
    }

    /// Sleep before answering, to make concurrency observable in tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Answer prompts containing `needle` with `response`.
    pub fn on(self, needle: &str, response: &str) -> Self {
        self.on_sequence(needle, &[response])
    }

    /// Answer prompts containing `needle` with each response in turn,
    /// repeating the last one once the sequence is exhausted.
    pub fn on_sequence(self, needle: &str, responses: &[&str]) -> Self {
        let replies = responses
            .iter()
            .map(|r| MockReply::Text((*r).to_string()))
            .collect();
        self.push_rule(needle, replies);
        self
    }

    /// Fail prompts containing `needle` with `error`.
    pub fn fail_on(self, needle: &str, error: ProviderError) -> Self {
        self.push_rule(needle, VecDeque::from([MockReply::Fail(error)]));
        self
    }

    fn push_rule(&self, needle: &str, replies: VecDeque<MockReply>) {
        if replies.is_empty() {
            return;
        }
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(MockRule {
                needle: needle.to_string(),
                replies,
            });
    }

    /// Queue a response for the next call that no rule matches.
    pub fn queue_response(&self, text: &str) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(MockReply::Text(text.to_string()));
    }

    pub fn queue_error(&self, error: ProviderError) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(MockReply::Fail(error));
    }

    /// All prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of received prompts containing `needle`.
    pub fn call_count(&self, needle: &str) -> usize {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|p| p.contains(needle))
            .count()
    }

    fn resolve(&self, prompt: &str) -> MockReply {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.to_string());

        let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(reply) = rules
            .iter_mut()
            .find(|r| prompt.contains(&r.needle))
            .and_then(MockRule::next_reply)
        {
            return reply;
        }
        drop(rules);

        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| MockReply::Text(self.default_response.clone()))
    }
}

impl Default for MockCompletionProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionProvider for MockCompletionProvider {
    async fn complete(&self, prompt: &str, _temperature: f32) -> Result<String, ProviderError> {
        let reply = self.resolve(prompt);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        reply.into_result()
    }

    async fn complete_streaming(
        &self,
        prompt: &str,
        temperature: f32,
        tx: mpsc::Sender<String>,
    ) -> Result<(), ProviderError> {
        let text = self.complete(prompt, temperature).await?;
        for chunk in text.split_inclusive(' ') {
            if tx.send(chunk.to_string()).await.is_err() {
                return Err(ProviderError::Streaming {
                    message: "receiver dropped".to_string(),
                });
            }
        }
        Ok(())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::cosine_similarity;

    #[tokio::test]
    async fn test_local_embedder_is_deterministic_and_normalised() {
        let embedder = LocalEmbeddingProvider::new(64);
        let a = embedder.embed("hybrid retrieval with bm25").await.unwrap();
        let b = embedder.embed("hybrid retrieval with bm25").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_local_embedder_similarity_tracks_vocabulary() {
        let embedder = LocalEmbeddingProvider::new(256);
        let q = embedder.embed("what is reciprocal rank fusion").await.unwrap();
        let near = embedder.embed("reciprocal rank fusion explained").await.unwrap();
        let far = embedder.embed("tomato soup recipe").await.unwrap();
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[tokio::test]
    async fn test_local_embedder_empty_text_is_zero_vector() {
        let embedder = LocalEmbeddingProvider::new(8);
        let v = embedder.embed("   ").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_embed_batch_default() {
        let embedder = LocalEmbeddingProvider::new(16);
        let out = embedder
            .embed_batch(&["a b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn test_mock_rules_take_priority_over_queue() {
        let mock = MockCompletionProvider::new().on("grade", "{\"score\": 0.9}");
        mock.queue_response("queued");
        assert_eq!(mock.complete("please grade this", 0.0).await.unwrap(), "{\"score\": 0.9}");
        assert_eq!(mock.complete("something else", 0.0).await.unwrap(), "queued");
        assert!(mock.complete("again", 0.0).await.unwrap().contains("mock model"));
        assert_eq!(mock.call_count("grade"), 1);
        assert_eq!(mock.prompts().len(), 3);
    }

    #[tokio::test]
    async fn test_mock_sequence_repeats_last() {
        let mock = MockCompletionProvider::new().on_sequence("judge", &["0.3", "0.8"]);
        assert_eq!(mock.complete("judge", 0.0).await.unwrap(), "0.3");
        assert_eq!(mock.complete("judge", 0.0).await.unwrap(), "0.8");
        assert_eq!(mock.complete("judge", 0.0).await.unwrap(), "0.8");
    }

    #[tokio::test]
    async fn test_mock_fail_on() {
        let mock = MockCompletionProvider::with_response("ok").fail_on(
            "boom",
            ProviderError::Timeout { timeout_secs: 1 },
        );
        assert!(mock.complete("boom now", 0.0).await.is_err());
        assert_eq!(mock.complete("fine", 0.0).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_mock_streaming_chunks_reassemble() {
        let mock = MockCompletionProvider::with_response("Hello there, friend");
        let (tx, mut rx) = mpsc::channel(16);
        mock.complete_streaming("hi", 0.7, tx).await.unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), "Hello there, friend");
    }

    #[tokio::test]
    async fn test_unavailable_completion_is_not_fatal() {
        let provider = UnavailableCompletionProvider::new("no api key");
        let err = provider.complete("hi", 0.0).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable { .. }));
        assert!(!err.is_fatal());

        let (tx, mut rx) = mpsc::channel(4);
        assert!(provider.complete_streaming("hi", 0.0, tx).await.is_err());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_failing_embedder() {
        let embedder = FailingEmbeddingProvider::new(
            8,
            ProviderError::Connection {
                message: "refused".into(),
            },
        );
        assert!(embedder.embed("x").await.is_err());
        assert_eq!(embedder.dimension(), 8);
    }
}
