//! Conversation sessions and their persistence.
//!
//! The engine never touches sessions itself; the conversation manager loads
//! one before a turn and saves it afterwards through a [`SessionStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::context::window::total_tokens;
use crate::error::ContextError;
use crate::types::ConversationMessage;

/// Bookkeeping kept alongside a session's messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Estimated tokens of the messages currently held.
    pub total_tokens: usize,
    pub message_count: usize,
    /// Messages removed by trimming over the session's lifetime.
    pub truncated_count: usize,
    /// User turns folded into summaries over the session's lifetime.
    pub summarized_rounds: usize,
}

/// One conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub messages: Vec<ConversationMessage>,
    pub metadata: SessionMetadata,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            messages: Vec::new(),
            metadata: SessionMetadata {
                created_at: now,
                updated_at: now,
                total_tokens: 0,
                message_count: 0,
                truncated_count: 0,
                summarized_rounds: 0,
            },
        }
    }

    pub fn push(&mut self, message: ConversationMessage) {
        self.messages.push(message);
        self.refresh();
    }

    /// Replace the message list after trimming or compression.
    pub fn replace_messages(&mut self, messages: Vec<ConversationMessage>) {
        self.messages = messages;
        self.refresh();
    }

    /// Recompute derived counters and bump `updated_at`.
    pub fn refresh(&mut self) {
        self.metadata.total_tokens = total_tokens(&self.messages);
        self.metadata.message_count = self.messages.len();
        self.metadata.updated_at = Utc::now();
    }
}

/// Loads and saves sessions by id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<Session>, ContextError>;

    async fn save(&self, session: &Session) -> Result<(), ContextError>;

    /// Returns whether a session was deleted.
    async fn delete(&self, session_id: &str) -> Result<bool, ContextError>;

    async fn list(&self) -> Result<Vec<String>, ContextError>;
}

/// Reject ids that could escape the session directory.
fn validate_id(session_id: &str) -> Result<(), ContextError> {
    let ok = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(ContextError::PersistenceError {
            message: format!("Invalid session id: {session_id:?}"),
        })
    }
}

/// One pretty-printed JSON file per session.
pub struct JsonFileSessionStore {
    dir: PathBuf,
}

impl JsonFileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf, ContextError> {
        validate_id(session_id)?;
        Ok(self.dir.join(format!("{session_id}.json")))
    }
}

#[async_trait]
impl SessionStore for JsonFileSessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<Session>, ContextError> {
        let path = self.path_for(session_id)?;
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ContextError::SessionLoadFailed {
                    message: format!("Failed to read session file: {}", e),
                });
            }
        };
        let session = serde_json::from_str(&json).map_err(|e| ContextError::SessionLoadFailed {
            message: format!("Failed to deserialize session: {}", e),
        })?;
        Ok(Some(session))
    }

    async fn save(&self, session: &Session) -> Result<(), ContextError> {
        let path = self.path_for(&session.id)?;
        let json =
            serde_json::to_string_pretty(session).map_err(|e| ContextError::PersistenceError {
                message: format!("Failed to serialize session: {}", e),
            })?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ContextError::PersistenceError {
                message: format!("Failed to create directory: {}", e),
            })?;

        tokio::fs::write(&path, json)
            .await
            .map_err(|e| ContextError::PersistenceError {
                message: format!("Failed to write session file: {}", e),
            })
    }

    async fn delete(&self, session_id: &str) -> Result<bool, ContextError> {
        let path = self.path_for(session_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ContextError::PersistenceError {
                message: format!("Failed to delete session file: {}", e),
            }),
        }
    }

    async fn list(&self) -> Result<Vec<String>, ContextError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ContextError::PersistenceError {
                    message: format!("Failed to list sessions: {}", e),
                });
            }
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ContextError::PersistenceError {
                message: format!("Failed to list sessions: {}", e),
            })?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Sessions held in process memory.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<Session>, ContextError> {
        Ok(self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned())
    }

    async fn save(&self, session: &Session) -> Result<(), ContextError> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<bool, ContextError> {
        Ok(self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
            .is_some())
    }

    async fn list(&self) -> Result<Vec<String>, ContextError> {
        let mut ids: Vec<String> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_session_push_updates_metadata() {
        let mut session = Session::new("s1");
        session.push(ConversationMessage::user("hello there"));
        session.push(ConversationMessage::assistant("hi"));
        assert_eq!(session.metadata.message_count, 2);
        assert_eq!(
            session.metadata.total_tokens,
            session.messages.iter().map(|m| m.token_count).sum::<usize>()
        );
        assert!(session.metadata.updated_at >= session.metadata.created_at);
    }

    #[tokio::test]
    async fn test_json_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileSessionStore::new(dir.path().join("sessions"));
        let mut session = Session::new("chat-1");
        session.push(ConversationMessage::user("What is RRF?"));

        store.save(&session).await.unwrap();
        let loaded = store.load("chat-1").await.unwrap().unwrap();
        assert_eq!(loaded, session);
        assert_eq!(store.list().await.unwrap(), vec!["chat-1".to_string()]);
    }

    #[tokio::test]
    async fn test_json_store_missing_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileSessionStore::new(dir.path());
        assert!(store.load("nope").await.unwrap().is_none());
        assert!(!store.delete("nope").await.unwrap());
        assert!(
            JsonFileSessionStore::new(dir.path().join("absent"))
                .list()
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_json_store_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileSessionStore::new(dir.path());
        store.save(&Session::new("gone")).await.unwrap();
        assert!(store.delete("gone").await.unwrap());
        assert!(store.load("gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_store_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileSessionStore::new(dir.path());
        assert!(store.load("../etc/passwd").await.is_err());
        assert!(store.save(&Session::new("a/b")).await.is_err());
    }

    #[tokio::test]
    async fn test_json_store_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        let store = JsonFileSessionStore::new(dir.path());
        let err = store.load("bad").await.unwrap_err();
        assert!(matches!(err, ContextError::SessionLoadFailed { .. }));
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemorySessionStore::new();
        store.save(&Session::new("b")).await.unwrap();
        store.save(&Session::new("a")).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["a", "b"]);
        assert!(store.load("a").await.unwrap().is_some());
        assert!(store.delete("a").await.unwrap());
        assert!(store.load("a").await.unwrap().is_none());
    }
}
