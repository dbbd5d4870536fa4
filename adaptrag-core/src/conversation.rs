//! Multi-turn conversations on top of the engine.
//!
//! Each turn loads the session, bounds the history that precedes the new
//! question, optionally resolves a dependent follow-up into a standalone
//! question, runs the engine and saves the session with the answer appended.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::context::{ContextSummarizer, ContextWindowManager, ReferenceResolver};
use crate::error::Result;
use crate::provider::CompletionProvider;
use crate::session::{Session, SessionStore};
use crate::types::{ConversationMessage, EngineEvent, QueryOptions, QueryResult};
use crate::workflow::RagEngine;

const STREAM_BUFFER: usize = 64;

/// A session prepared for the next engine call.
struct PreparedTurn {
    session: Session,
    /// The question sent to the engine; differs from the user's input after
    /// reference resolution.
    query: String,
    options: QueryOptions,
}

/// Drives conversations through a [`RagEngine`] and a [`SessionStore`].
pub struct ConversationManager {
    engine: Arc<RagEngine>,
    store: Arc<dyn SessionStore>,
    window: ContextWindowManager,
    summarizer: ContextSummarizer,
    resolver: Option<ReferenceResolver>,
}

impl ConversationManager {
    /// `llm` is used for history summaries and follow-up resolution.
    pub fn new(
        engine: Arc<RagEngine>,
        store: Arc<dyn SessionStore>,
        llm: Arc<dyn CompletionProvider>,
    ) -> Self {
        let context = engine.config().context.clone();
        let resolver = context
            .resolve_references
            .then(|| ReferenceResolver::new(Arc::clone(&llm)));
        Self {
            window: ContextWindowManager::new(context),
            summarizer: ContextSummarizer::new(llm),
            resolver,
            engine,
            store,
        }
    }

    pub fn engine(&self) -> &Arc<RagEngine> {
        &self.engine
    }

    /// Run one turn with the engine's default options.
    pub async fn ask(&self, session_id: &str, input: &str) -> Result<QueryResult> {
        self.ask_with_options(session_id, input, self.engine.default_options())
            .await
    }

    /// Run one turn. Any history already in `options` is replaced by the
    /// session's.
    pub async fn ask_with_options(
        &self,
        session_id: &str,
        input: &str,
        options: QueryOptions,
    ) -> Result<QueryResult> {
        let PreparedTurn {
            mut session,
            query,
            options,
        } = self.prepare(session_id, input, options).await?;

        let result = self.engine.query(&query, options).await?;
        session.push(ConversationMessage::assistant(result.answer.clone()));
        self.store.save(&session).await?;
        info!(
            session = %session.id,
            messages = session.metadata.message_count,
            tokens = session.metadata.total_tokens,
            "Conversation turn saved"
        );
        Ok(result)
    }

    /// Streaming variant of [`ask_with_options`](Self::ask_with_options).
    /// The session is saved once the engine's `Done` event has been
    /// forwarded; an aborted turn leaves the stored session untouched.
    pub async fn ask_streaming(
        self: &Arc<Self>,
        session_id: &str,
        input: &str,
        options: QueryOptions,
    ) -> Result<ReceiverStream<EngineEvent>> {
        let PreparedTurn {
            mut session,
            query,
            options,
        } = self.prepare(session_id, input, options).await?;

        let mut events = self.engine.stream_query(query, options);
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let EngineEvent::Done(result) = &event {
                    session.push(ConversationMessage::assistant(result.answer.clone()));
                    if let Err(e) = manager.store.save(&session).await {
                        warn!(session = %session.id, error = %e, "Failed to save session");
                    }
                }
                if tx.send(event).await.is_err() {
                    debug!("Conversation stream consumer dropped");
                }
            }
        });
        Ok(ReceiverStream::new(rx))
    }

    pub async fn session(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.store.load(session_id).await?)
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        Ok(self.store.delete(session_id).await?)
    }

    pub async fn list_sessions(&self) -> Result<Vec<String>> {
        Ok(self.store.list().await?)
    }

    async fn prepare(
        &self,
        session_id: &str,
        input: &str,
        options: QueryOptions,
    ) -> Result<PreparedTurn> {
        let mut session = match self.store.load(session_id).await? {
            Some(session) => session,
            None => {
                debug!(session = session_id, "Starting new session");
                Session::new(session_id)
            }
        };

        if self.window.needs_compression(&session.messages)
            && let Some(compression) = self
                .window
                .compress(&session.messages, &self.summarizer)
                .await
        {
            session.metadata.summarized_rounds += compression.rounds_summarized;
            session.replace_messages(compression.messages);
        }

        let user_message = ConversationMessage::user(input);
        let trimmed = self.window.trim_for_turn(&session.messages, &user_message);
        if trimmed.removed > 0 {
            session.metadata.truncated_count += trimmed.removed;
            session.replace_messages(trimmed.messages);
        }

        let history = session.messages.clone();
        session.push(user_message);

        let query = match &self.resolver {
            Some(resolver) => {
                let resolved = resolver.resolve(input, &history).await;
                if resolved.resolved {
                    debug!(original = input, resolved = %resolved.query, "Follow-up resolved");
                }
                resolved.query
            }
            None => input.to_string(),
        };

        Ok(PreparedTurn {
            session,
            query,
            options: options.with_history(history),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::context::resolver::RESOLVE_PROMPT_HEADER;
    use crate::context::summarizer::SUMMARY_PROMPT_HEADER;
    use crate::provider::{LocalEmbeddingProvider, MockCompletionProvider};
    use crate::session::InMemorySessionStore;
    use crate::store::InMemoryVectorStore;
    use crate::types::Role;

    const DIM: usize = 64;

    fn manager_with(llm: Arc<MockCompletionProvider>, config: EngineConfig) -> ConversationManager {
        let engine = RagEngine::builder(
            llm.clone(),
            Arc::new(LocalEmbeddingProvider::new(DIM)),
            Arc::new(InMemoryVectorStore::new(DIM)),
        )
        .config(config)
        .build()
        .unwrap();
        ConversationManager::new(
            Arc::new(engine),
            Arc::new(InMemorySessionStore::new()),
            llm,
        )
    }

    fn uncached() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.cache.enabled = false;
        config.verification.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_turn_appends_both_messages() {
        let llm = Arc::new(MockCompletionProvider::new().on("Answer:", "Paris."));
        let manager = manager_with(llm, uncached());

        let result = manager.ask("s1", "What is the capital of France?").await.unwrap();
        assert_eq!(result.answer, "Paris.");

        let session = manager.session("s1").await.unwrap().unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, Role::User);
        assert_eq!(session.messages[1].content, "Paris.");
        assert_eq!(session.metadata.message_count, 2);
        assert!(session.metadata.total_tokens > 0);
    }

    #[tokio::test]
    async fn test_history_excludes_current_question() {
        let llm = Arc::new(MockCompletionProvider::new().on("Answer:", "ok"));
        let manager = manager_with(llm.clone(), uncached());
        manager.ask("s1", "first question about rust").await.unwrap();
        manager.ask("s1", "second question about tokio").await.unwrap();

        let generation = llm
            .prompts()
            .into_iter()
            .rfind(|p| p.contains("Question: second question about tokio"))
            .unwrap();
        assert!(generation.contains("first question about rust"));
        let history_section = generation.split("Question:").next().unwrap();
        assert!(!history_section.contains("second question about tokio"));
    }

    #[tokio::test]
    async fn test_trimming_counts_removed_messages() {
        let mut config = uncached();
        config.context.max_rounds = 1;
        config.context.compression_enabled = false;
        let llm = Arc::new(MockCompletionProvider::new().on("Answer:", "ok"));
        let manager = manager_with(llm, config);

        for i in 0..3 {
            manager.ask("s1", &format!("question number {i}")).await.unwrap();
        }
        let session = manager.session("s1").await.unwrap().unwrap();
        assert!(session.metadata.truncated_count > 0);
        assert!(session.messages.len() <= 3);
        assert_eq!(session.messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_oversized_question_survives_trimming() {
        let mut config = uncached();
        config.context.max_tokens = 50;
        let llm = Arc::new(MockCompletionProvider::new().on("Answer:", "ok"));
        let manager = manager_with(llm, config);

        manager.ask("s1", "what is rust").await.unwrap();
        let question = "please explain ".repeat(40);
        manager.ask("s1", &question).await.unwrap();

        let session = manager.session("s1").await.unwrap().unwrap();
        let roles: Vec<Role> = session.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert_eq!(session.messages[0].content, question);
        assert_eq!(session.metadata.truncated_count, 2);
    }

    #[tokio::test]
    async fn test_compression_records_summarized_rounds() {
        let mut config = uncached();
        config.context.compress_after_rounds = 3;
        config.context.keep_recent = 2;
        let llm = Arc::new(
            MockCompletionProvider::new()
                .on(SUMMARY_PROMPT_HEADER, "They talked about databases.")
                .on("Answer:", "ok"),
        );
        let manager = manager_with(llm, config);

        for i in 0..4 {
            manager.ask("s1", &format!("tell me about database {i}")).await.unwrap();
        }
        let session = manager.session("s1").await.unwrap().unwrap();
        // Turn four folds the two oldest rounds, keeping the last two messages.
        assert_eq!(session.metadata.summarized_rounds, 2);
        assert_eq!(session.messages.iter().filter(|m| m.is_summary).count(), 1);
    }

    #[tokio::test]
    async fn test_follow_up_is_resolved_before_the_engine_runs() {
        let mut config = uncached();
        config.context.resolve_references = true;
        let llm = Arc::new(
            MockCompletionProvider::new()
                .on(RESOLVE_PROMPT_HEADER, "Who founded Tesla?")
                .on("Answer:", "Several people."),
        );
        let manager = manager_with(llm, config);
        manager.ask("s1", "Tell me about Tesla").await.unwrap();

        let result = manager.ask("s1", "What about its founders?").await.unwrap();
        assert_eq!(result.query, "Who founded Tesla?");

        let session = manager.session("s1").await.unwrap().unwrap();
        assert_eq!(session.messages[2].content, "What about its founders?");
    }

    #[tokio::test]
    async fn test_streaming_turn_saves_session() {
        let llm = Arc::new(MockCompletionProvider::new().on("Answer:", "Streamed."));
        let manager = Arc::new(manager_with(llm, uncached()));

        let events: Vec<EngineEvent> = manager
            .ask_streaming("s2", "What is streaming?", QueryOptions::default())
            .await
            .unwrap()
            .collect()
            .await;
        assert!(matches!(events.last(), Some(EngineEvent::Done(_))));

        let session = manager.session("s2").await.unwrap().unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[1].content, "Streamed.");
    }

    #[tokio::test]
    async fn test_delete_and_list_sessions() {
        let llm = Arc::new(MockCompletionProvider::new().on("Answer:", "ok"));
        let manager = manager_with(llm, uncached());
        manager.ask("a", "hello there friend, what is rust").await.unwrap();
        manager.ask("b", "what is tokio").await.unwrap();
        assert_eq!(manager.list_sessions().await.unwrap(), vec!["a", "b"]);
        assert!(manager.delete_session("a").await.unwrap());
        assert!(manager.session("a").await.unwrap().is_none());
    }
}
