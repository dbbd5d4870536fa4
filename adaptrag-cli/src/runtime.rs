//! Wires configuration, providers, the corpus and session storage into an
//! engine plus conversation manager.

use adaptrag_core::config::EmbeddingModelConfig;
use adaptrag_core::provider::{
    CompletionProvider, EmbeddingProvider, LocalEmbeddingProvider, UnavailableCompletionProvider,
};
use adaptrag_core::providers::{
    create_completion_provider, create_embedding_providers, create_fast_completion_provider,
};
use adaptrag_core::session::JsonFileSessionStore;
use adaptrag_core::store::InMemoryVectorStore;
use adaptrag_core::{ConversationManager, EngineConfig, RagEngine};
use std::path::Path;
use std::sync::Arc;

use crate::commands::session_dir;
use crate::corpus;

/// Fallback answer used when no completion model could be configured.
pub const NO_COMPLETION_MESSAGE: &str = "No completion model is available. Set the API key named by \
     llm.api_key_env (or point llm.base_url at a local server) and try again.";

pub struct Runtime {
    pub engine: Arc<RagEngine>,
    pub conversations: Arc<ConversationManager>,
    pub completion_available: bool,
    pub indexed: usize,
}

impl Runtime {
    pub async fn build(
        mut config: EngineConfig,
        workspace: &Path,
        corpus_dir: Option<&Path>,
    ) -> anyhow::Result<Self> {
        let (llm, completion_available) = match create_completion_provider(&config.llm) {
            Ok(p) => (p, true),
            Err(e) => {
                tracing::warn!("Completion provider init failed: {}. Completion unavailable.", e);
                config.workflow.fallback_answer = NO_COMPLETION_MESSAGE.to_string();
                let unavailable: Arc<dyn CompletionProvider> =
                    Arc::new(UnavailableCompletionProvider::new(e.to_string()));
                (unavailable, false)
            }
        };
        let fast_llm = if completion_available {
            create_fast_completion_provider(&config.llm).unwrap_or_else(|e| {
                tracing::warn!("Fast model init failed: {}. Using the main model.", e);
                None
            })
        } else {
            None
        };

        let embedders = match create_embedding_providers(&config.embedding) {
            Ok(embedders) => embedders,
            Err(e) => {
                tracing::warn!("Embedding provider init failed: {}. Using local embeddings.", e);
                config.embedding.alternates.clear();
                config.embedding.provider = "local".to_string();
                let local = config.embedding.primary();
                vec![local_embedder(&local)]
            }
        };
        let mut embedders = embedders.into_iter();
        let Some(embedder) = embedders.next() else {
            anyhow::bail!("No embedding provider configured");
        };

        let store = Arc::new(InMemoryVectorStore::new(embedder.dimension()));
        let indexed = match corpus_dir {
            Some(dir) => {
                let passages = corpus::load_passages(dir)?;
                corpus::index_passages(&passages, embedder.as_ref(), &store).await?
            }
            None => 0,
        };

        let sessions = Arc::new(JsonFileSessionStore::new(session_dir(&config, workspace)));
        let mut builder = RagEngine::builder(Arc::clone(&llm), embedder, store).config(config);
        if let Some(fast) = fast_llm {
            builder = builder.fast_llm(fast);
        }
        for alternate in embedders {
            builder = builder.alternate_embedder(alternate);
        }
        let engine = Arc::new(builder.build()?);
        let conversations = Arc::new(ConversationManager::new(
            Arc::clone(&engine),
            sessions,
            llm,
        ));

        Ok(Self {
            engine,
            conversations,
            completion_available,
            indexed,
        })
    }
}

fn local_embedder(model: &EmbeddingModelConfig) -> Arc<dyn EmbeddingProvider> {
    Arc::new(LocalEmbeddingProvider::new(model.dimension).with_model_name(model.model.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use adaptrag_core::types::NodeStatus;

    fn offline_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.llm.api_key_env = "ADAPTRAG_TEST_UNSET_KEY".to_string();
        config.embedding.api_key_env = "ADAPTRAG_TEST_UNSET_KEY".to_string();
        config.verification.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_offline_runtime_falls_back_to_local_providers() {
        let workspace = tempfile::tempdir().unwrap();
        let corpus = tempfile::tempdir().unwrap();
        std::fs::write(
            corpus.path().join("notes.md"),
            "Tokio is an asynchronous runtime for the Rust programming language.",
        )
        .unwrap();

        let runtime = Runtime::build(offline_config(), workspace.path(), Some(corpus.path()))
            .await
            .unwrap();
        assert!(!runtime.completion_available);
        assert_eq!(runtime.indexed, 1);

        let result = runtime
            .engine
            .query("What is Tokio?", runtime.engine.default_options())
            .await
            .unwrap();
        assert_eq!(result.answer, NO_COMPLETION_MESSAGE);
        assert_eq!(result.retrieved_docs.len(), 1);
        assert_eq!(result.count_steps("generate", NodeStatus::Error), 1);
        assert_eq!(runtime.engine.cache_len(), 0);
    }
}
