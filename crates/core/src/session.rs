use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::message::{PlatformId, UserId};

/// Maximum retained conversation turns (3 user/assistant exchanges).
pub const HISTORY_WINDOW: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message in a conversation. Append-only and immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), timestamp: Utc::now() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into(), timestamp: Utc::now() }
    }
}

/// Composite session address: one session per user per platform.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub platform: PlatformId,
    pub user_id: UserId,
}

/// Persisted per-user conversational state.
///
/// `version` backs optimistic writes in the store: it is the version the
/// session was loaded at (0 for a fresh session) and the store bumps it on
/// every successful `put`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub history: Vec<Turn>,
    pub started_at: DateTime<Utc>,
    pub message_count: u64,
    pub last_message_at: DateTime<Utc>,
    #[serde(default)]
    pub version: i64,
}

impl Session {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            history: Vec::new(),
            started_at: now,
            message_count: 0,
            last_message_at: now,
            version: 0,
        }
    }

    /// Appends a turn and re-applies the history window, dropping the oldest
    /// turns first so the window always reflects the latest exchanges.
    pub fn push_turn(&mut self, turn: Turn) {
        self.history.push(turn);
        self.truncate_history();
    }

    pub fn truncate_history(&mut self) {
        if self.history.len() > HISTORY_WINDOW {
            let excess = self.history.len() - HISTORY_WINDOW;
            self.history.drain(..excess);
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("session load failed: {0}")]
    Load(String),
    #[error("session save failed: {0}")]
    Save(String),
    #[error("stale session write for {platform}/{user_id}: version {expected} was superseded")]
    Conflict { platform: PlatformId, user_id: UserId, expected: i64 },
}

/// Key-value session persistence, externally owned. TTL/expiry is the
/// collaborator's concern; this core never deletes sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &SessionKey) -> Result<Option<Session>, SessionStoreError>;

    /// Writes the session, rejecting the write with `Conflict` when the
    /// stored version no longer matches `session.version`.
    async fn put(&self, key: &SessionKey, session: &Session) -> Result<(), SessionStoreError>;
}

/// Version-checked in-memory store for tests and local development.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionKey, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, key: &SessionKey) -> Result<Option<Session>, SessionStoreError> {
        Ok(self.sessions.read().await.get(key).cloned())
    }

    async fn put(&self, key: &SessionKey, session: &Session) -> Result<(), SessionStoreError> {
        let mut sessions = self.sessions.write().await;
        let stored_version = sessions.get(key).map(|stored| stored.version).unwrap_or(0);
        if stored_version != session.version {
            return Err(SessionStoreError::Conflict {
                platform: key.platform,
                user_id: key.user_id.clone(),
                expected: session.version,
            });
        }

        let mut next = session.clone();
        next.version += 1;
        sessions.insert(key.clone(), next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::message::{PlatformId, UserId};

    use super::{
        InMemorySessionStore, Session, SessionKey, SessionStore, SessionStoreError, Turn,
        HISTORY_WINDOW,
    };

    #[test]
    fn history_window_keeps_only_the_most_recent_turns() {
        let mut session = Session::new(Utc::now());
        for index in 0..10 {
            session.push_turn(Turn::user(format!("message {index}")));
        }

        assert_eq!(session.history.len(), HISTORY_WINDOW);
        assert_eq!(session.history.first().map(|turn| turn.content.as_str()), Some("message 4"));
        assert_eq!(session.history.last().map(|turn| turn.content.as_str()), Some("message 9"));
    }

    #[test]
    fn truncation_is_a_no_op_below_the_window() {
        let mut session = Session::new(Utc::now());
        session.push_turn(Turn::user("hola"));
        session.push_turn(Turn::assistant("buenas"));
        session.truncate_history();

        assert_eq!(session.history.len(), 2);
    }

    #[tokio::test]
    async fn in_memory_store_roundtrips_and_bumps_version() {
        let store = InMemorySessionStore::new();
        let key = key_fixture();

        assert!(store.get(&key).await.expect("get should succeed").is_none());

        let mut session = Session::new(Utc::now());
        session.push_turn(Turn::user("hola"));
        store.put(&key, &session).await.expect("first put should succeed");

        let loaded = store.get(&key).await.expect("get should succeed").expect("session exists");
        assert_eq!(loaded.history.len(), 1);
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn stale_write_is_rejected_with_conflict() {
        let store = InMemorySessionStore::new();
        let key = key_fixture();

        let session = Session::new(Utc::now());
        store.put(&key, &session).await.expect("first put should succeed");

        // Second write still claims version 0, but the store is at 1.
        let error = store.put(&key, &session).await.err().expect("stale write must fail");
        assert!(matches!(error, SessionStoreError::Conflict { expected: 0, .. }));
    }

    fn key_fixture() -> SessionKey {
        SessionKey { platform: PlatformId::Whatsapp, user_id: UserId("34600111222".to_owned()) }
    }
}
