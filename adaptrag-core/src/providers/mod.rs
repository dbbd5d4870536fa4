//! HTTP model providers and provider construction from configuration.
//!
//! The engine only sees the [`CompletionProvider`] and [`EmbeddingProvider`]
//! traits. This module builds concrete ones from [`EngineConfig`]:
//! OpenAI-compatible endpoints (OpenAI, Azure, Ollama, vLLM, LM Studio) or the
//! offline hashed embedder.

pub mod openai_compat;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{EmbeddingConfig, EmbeddingModelConfig, EngineConfig, LlmConfig};
use crate::error::ProviderError;
use crate::provider::{CompletionProvider, EmbeddingProvider, LocalEmbeddingProvider};

pub use openai_compat::{OpenAiCompatibleProvider, OpenAiEmbeddingProvider};

/// Backoff policy for transient provider errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn from_llm(config: &LlmConfig) -> Self {
        Self {
            max_retries: config.retry_attempts,
            ..Default::default()
        }
    }
}

/// Execute an async operation with exponential backoff on transient errors.
///
/// Rate limits (respecting `retry_after_secs`), streaming, connection and
/// timeout errors are retried; everything else returns immediately.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T, ProviderError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !e.is_retryable() || attempt >= config.max_retries {
                    return Err(e);
                }

                let backoff_ms = compute_backoff(config, attempt, &e);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = config.max_retries,
                    backoff_ms,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                attempt += 1;
            }
        }
    }
}

/// Backoff delay, never shorter than a server-provided retry-after.
fn compute_backoff(config: &RetryConfig, attempt: u32, err: &ProviderError) -> u64 {
    let computed = compute_exponential_backoff(config, attempt);
    if let ProviderError::RateLimited { retry_after_secs } = err {
        return (retry_after_secs * 1000).max(computed);
    }
    computed
}

fn compute_exponential_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(config.max_backoff_ms as f64) as u64;
    if config.jitter {
        // Up to 25% extra.
        capped + (capped as f64 * 0.25 * jitter_fraction()) as u64
    } else {
        capped
    }
}

fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// Whether a base URL points at a local server that needs no API key.
pub(crate) fn is_local_url(base_url: Option<&str>) -> bool {
    base_url.is_some_and(|u| u.contains("localhost") || u.contains("127.0.0.1"))
}

/// Read an API key from `env_var`, accepting a placeholder for local servers.
pub fn resolve_api_key(env_var: &str, base_url: Option<&str>) -> Result<String, ProviderError> {
    match std::env::var(env_var) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ if is_local_url(base_url) => {
            tracing::debug!("No API key set for local provider; using placeholder token");
            Ok("local".to_string())
        }
        _ => Err(ProviderError::AuthFailed {
            provider: format!("env var '{env_var}' not set"),
        }),
    }
}

const OPENAI_COMPATIBLE: &[&str] = &["openai", "azure", "ollama", "vllm", "lmstudio", "openai-compatible"];

/// Build the main completion provider.
pub fn create_completion_provider(
    config: &LlmConfig,
) -> Result<Arc<dyn CompletionProvider>, ProviderError> {
    create_completion_provider_for_model(config, &config.model)
}

/// Build the fast judge provider, or `None` when no fast model is configured.
pub fn create_fast_completion_provider(
    config: &LlmConfig,
) -> Result<Option<Arc<dyn CompletionProvider>>, ProviderError> {
    config
        .fast_model
        .as_deref()
        .filter(|m| !m.is_empty() && *m != config.model)
        .map(|model| create_completion_provider_for_model(config, model))
        .transpose()
}

fn create_completion_provider_for_model(
    config: &LlmConfig,
    model: &str,
) -> Result<Arc<dyn CompletionProvider>, ProviderError> {
    let provider = config.provider.to_lowercase();
    if OPENAI_COMPATIBLE.contains(&provider.as_str()) {
        Ok(Arc::new(OpenAiCompatibleProvider::new(config, model)?))
    } else {
        Err(ProviderError::InvalidConfig {
            message: format!("unknown completion provider '{}'", config.provider),
        })
    }
}

/// Build one embedding provider.
pub fn create_embedding_provider(
    model: &EmbeddingModelConfig,
    config: &EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingProvider>, ProviderError> {
    match model.provider.to_lowercase().as_str() {
        "local" => Ok(Arc::new(
            LocalEmbeddingProvider::new(model.dimension).with_model_name(model.model.clone()),
        )),
        p if OPENAI_COMPATIBLE.contains(&p) => {
            Ok(Arc::new(OpenAiEmbeddingProvider::new(model, config)?))
        }
        _ => Err(ProviderError::InvalidConfig {
            message: format!("unknown embedding provider '{}'", model.provider),
        }),
    }
}

/// The primary embedder followed by the configured alternates.
pub fn create_embedding_providers(
    config: &EmbeddingConfig,
) -> Result<Vec<Arc<dyn EmbeddingProvider>>, ProviderError> {
    std::iter::once(config.primary())
        .chain(config.alternates.iter().cloned())
        .map(|model| create_embedding_provider(&model, config))
        .collect()
}

/// Every provider an engine needs, built from one configuration.
pub struct ProviderSet {
    pub llm: Arc<dyn CompletionProvider>,
    pub fast_llm: Option<Arc<dyn CompletionProvider>>,
    /// Primary first, then alternates.
    pub embedders: Vec<Arc<dyn EmbeddingProvider>>,
}

pub fn create_providers(config: &EngineConfig) -> Result<ProviderSet, ProviderError> {
    Ok(ProviderSet {
        llm: create_completion_provider(&config.llm)?,
        fast_llm: create_fast_completion_provider(&config.llm)?,
        embedders: create_embedding_providers(&config.embedding)?,
    })
}
