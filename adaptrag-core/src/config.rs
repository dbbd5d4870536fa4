//! Configuration system for adaptrag.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config -> environment variables -> explicit overrides.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Top-level configuration for the adaptrag engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub grading: GradingConfig,
    pub cache: CacheConfig,
    pub context: ContextConfig,
    pub verification: VerificationConfig,
    pub workflow: WorkflowConfig,
    pub session: SessionConfig,
}

/// Completion model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name: "openai" (any OpenAI-compatible endpoint) or "mock".
    pub provider: String,
    /// Model used for answer generation.
    pub model: String,
    /// Cheaper model used for judging, rewriting and intent analysis.
    /// Falls back to `model` when unset.
    pub fast_model: Option<String>,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    pub base_url: Option<String>,
    /// Temperature for answer generation.
    pub temperature: f32,
    /// Temperature for judge/rewrite/analysis calls.
    pub judge_temperature: f32,
    pub max_tokens: usize,
    pub timeout_secs: u64,
    /// Attempts per provider call for transient failures.
    pub retry_attempts: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            fast_model: Some("gpt-4o-mini".to_string()),
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: None,
            temperature: 0.7,
            judge_temperature: 0.0,
            max_tokens: 2048,
            timeout_secs: 60,
            retry_attempts: 3,
        }
    }
}

/// An embedding model the engine may use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingModelConfig {
    /// "local" (hashed bag-of-words) or "openai".
    pub provider: String,
    pub model: String,
    pub dimension: usize,
}

/// Embedding provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub dimension: usize,
    pub api_key_env: String,
    pub base_url: Option<String>,
    /// Tried in order when the primary model's dimension does not match the store.
    pub alternates: Vec<EmbeddingModelConfig>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            model: "local-hash".to_string(),
            dimension: 384,
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: None,
            alternates: Vec::new(),
        }
    }
}

impl EmbeddingConfig {
    pub fn primary(&self) -> EmbeddingModelConfig {
        EmbeddingModelConfig {
            provider: self.provider.clone(),
            model: self.model.clone(),
            dimension: self.dimension,
        }
    }
}

/// Hybrid retrieval, fusion and rerank settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub similarity_threshold: f32,
    pub enable_sparse: bool,
    pub enable_rerank: bool,
    pub rerank_top_k: usize,
    /// Dense over-fetch factor when the sparse leg needs a candidate pool.
    pub candidate_multiplier: usize,
    pub rrf_k: f32,
    pub dense_weight: f32,
    pub sparse_weight: f32,
    pub bm25_k1: f32,
    pub bm25_b: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            similarity_threshold: 0.0,
            enable_sparse: true,
            enable_rerank: false,
            rerank_top_k: 3,
            candidate_multiplier: 3,
            rrf_k: 60.0,
            dense_weight: 0.6,
            sparse_weight: 0.4,
            bm25_k1: 1.5,
            bm25_b: 0.75,
        }
    }
}

/// Grading and rewrite-retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GradingConfig {
    pub pass_threshold: f32,
    /// Accepted for compatibility; a turn still rewrites at most once.
    pub max_retries: u32,
    /// Documents summarised for the judge.
    pub max_documents: usize,
    /// Characters kept per document in the judge prompt.
    pub document_char_limit: usize,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            pass_threshold: 0.5,
            max_retries: 1,
            max_documents: 10,
            document_char_limit: 300,
        }
    }
}

/// Semantic cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub similarity_threshold: f32,
    pub capacity: usize,
    /// Entries older than this are ignored and dropped on lookup.
    pub ttl_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: 0.95,
            capacity: 256,
            ttl_secs: None,
        }
    }
}

/// How conversation history is bounded before each turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    SlidingWindow,
    TokenLimit,
    Hybrid,
}

impl std::fmt::Display for ContextStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextStrategy::SlidingWindow => write!(f, "sliding_window"),
            ContextStrategy::TokenLimit => write!(f, "token_limit"),
            ContextStrategy::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// Context window manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub strategy: ContextStrategy,
    pub max_rounds: usize,
    pub max_tokens: usize,
    pub preserve_system_prompt: bool,
    pub compression_enabled: bool,
    /// Rounds (user/assistant pairs) after which compression is attempted.
    pub compress_after_rounds: usize,
    /// Messages left verbatim after compression.
    pub keep_recent: usize,
    /// Resolve pronoun-led and elliptical follow-ups against history.
    pub resolve_references: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            strategy: ContextStrategy::Hybrid,
            max_rounds: 10,
            max_tokens: 4000,
            preserve_system_prompt: true,
            compression_enabled: true,
            compress_after_rounds: 6,
            keep_recent: 4,
            resolve_references: true,
        }
    }
}

/// Post-hoc verification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub enabled: bool,
    /// Minimum verifier confidence before a correction is emitted.
    pub confidence_threshold: f32,
    /// Capacity of the correction broadcast channel.
    pub channel_capacity: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.8,
            channel_capacity: 64,
        }
    }
}

/// State machine executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Hard ceiling on node visits per turn.
    pub max_steps: usize,
    /// Answer returned when generation fails.
    pub fallback_answer: String,
    /// System prompt prepended to generation.
    pub system_prompt: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_steps: 25,
            fallback_answer: "Sorry, I could not produce an answer right now. Please try again."
                .to_string(),
            system_prompt: "You are a helpful assistant. Answer using the provided context when \
                            it is relevant, and say so when the context does not contain the answer."
                .to_string(),
        }
    }
}

/// Session persistence settings (used by the conversation manager's caller).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub directory: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(".adaptrag/sessions"),
        }
    }
}

impl EngineConfig {
    /// Soft checks that do not prevent the engine from running.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.grading.max_retries > 1 {
            warnings.push(format!(
                "grading.max_retries is {} but a turn rewrites its query at most once",
                self.grading.max_retries
            ));
        }
        if self.cache.similarity_threshold < 0.8 {
            warnings.push(format!(
                "cache.similarity_threshold {} is low; unrelated queries may share answers",
                self.cache.similarity_threshold
            ));
        }
        if self.context.keep_recent > self.context.max_rounds * 2 {
            warnings.push(format!(
                "context.keep_recent ({}) exceeds the sliding window ({} messages)",
                self.context.keep_recent,
                self.context.max_rounds * 2
            ));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            warnings.push(format!(
                "llm.temperature {} is outside the usual 0.0-2.0 range",
                self.llm.temperature
            ));
        }

        warnings
    }

    /// Hard checks; a failure here is a terminal configuration error.
    pub fn check(&self) -> Result<(), ConfigError> {
        let unit = 0.0..=1.0;
        if !unit.contains(&self.grading.pass_threshold) {
            return Err(ConfigError::Invalid {
                message: format!(
                    "grading.pass_threshold must be in [0, 1], got {}",
                    self.grading.pass_threshold
                ),
            });
        }
        if !unit.contains(&self.cache.similarity_threshold) {
            return Err(ConfigError::Invalid {
                message: format!(
                    "cache.similarity_threshold must be in [0, 1], got {}",
                    self.cache.similarity_threshold
                ),
            });
        }
        if self.cache.enabled && self.cache.capacity == 0 {
            return Err(ConfigError::Invalid {
                message: "cache.capacity must be greater than zero".to_string(),
            });
        }
        if self.retrieval.top_k == 0 {
            return Err(ConfigError::Invalid {
                message: "retrieval.top_k must be greater than zero".to_string(),
            });
        }
        if self.retrieval.dense_weight < 0.0 || self.retrieval.sparse_weight < 0.0 {
            return Err(ConfigError::Invalid {
                message: "fusion weights must not be negative".to_string(),
            });
        }
        if self.embedding.dimension == 0 {
            return Err(ConfigError::Invalid {
                message: "embedding.dimension must be greater than zero".to_string(),
            });
        }
        if self.workflow.max_steps == 0 {
            return Err(ConfigError::Invalid {
                message: "workflow.max_steps must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "adaptrag", "adaptrag")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".adaptrag").join("config.toml")
}

/// Load configuration from all layers.
///
/// Priority (highest wins): explicit overrides, `ADAPTRAG_*` environment
/// variables (`__` separates nesting, e.g. `ADAPTRAG_CACHE__CAPACITY`),
/// `<workspace>/.adaptrag/config.toml`, the user-level config file, defaults.
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&EngineConfig>,
) -> Result<EngineConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    figment = figment.merge(Env::prefixed("ADAPTRAG_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Load a single explicit config file on top of the defaults.
pub fn load_config_file(path: &Path) -> Result<EngineConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    Figment::from(Serialized::defaults(EngineConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("ADAPTRAG_").split("__"))
        .extract()
        .map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
}

/// Whether any adaptrag configuration file exists (user-level or workspace-level).
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if user_config_path().is_some_and(|p| p.exists()) {
        return true;
    }
    workspace.is_some_and(|ws| workspace_config_path(ws).exists())
}
