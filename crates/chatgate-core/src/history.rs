//! Chat history: sessions and their messages in a sled database.
//!
//! Two trees. `sessions` maps session id to a JSON `SessionRecord`;
//! `messages` maps `{session_id}\x1f{seq:020}` to a JSON `StoredMessage`, so a
//! prefix scan returns one session's messages in insertion order.

use crate::error::PersistenceError;
use crate::types::Role;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_SESSION_TITLE: &str = "New conversation";
const KEY_SEPARATOR: char = '\u{1f}';

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistence used by the coordinator. Failures are logged by callers and
/// never end a chat.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create the session if missing, otherwise bump `updated_at`.
    async fn upsert_session(
        &self,
        session_id: &str,
        title: Option<&str>,
    ) -> Result<SessionRecord, PersistenceError>;

    async fn insert_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
    ) -> Result<StoredMessage, PersistenceError>;

    /// Oldest first, at most `limit`.
    async fn list_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, PersistenceError>;

    /// Most recently updated first, at most `limit`.
    async fn list_sessions(&self, limit: usize) -> Result<Vec<SessionRecord>, PersistenceError>;

    /// Remove a session and all of its messages. Returns whether it existed.
    async fn delete_session(&self, session_id: &str) -> Result<bool, PersistenceError>;
}

pub struct SledHistoryStore {
    db: sled::Db,
    sessions: sled::Tree,
    messages: sled::Tree,
}

impl SledHistoryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory database removed on drop.
    pub fn temporary() -> Result<Self, PersistenceError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, PersistenceError> {
        let sessions = db.open_tree("sessions")?;
        let messages = db.open_tree("messages")?;
        Ok(Self { db, sessions, messages })
    }

    fn message_prefix(session_id: &str) -> String {
        format!("{session_id}{KEY_SEPARATOR}")
    }
}

#[async_trait]
impl HistoryStore for SledHistoryStore {
    async fn upsert_session(
        &self,
        session_id: &str,
        title: Option<&str>,
    ) -> Result<SessionRecord, PersistenceError> {
        let now = Utc::now();
        let title = title.map(str::trim).filter(|t| !t.is_empty());
        let record = match self.sessions.get(session_id.as_bytes())? {
            Some(raw) => {
                let mut existing: SessionRecord = serde_json::from_slice(&raw)?;
                existing.updated_at = now;
                if let Some(title) = title {
                    existing.title = title.to_string();
                }
                existing
            }
            None => SessionRecord {
                id: session_id.to_string(),
                title: title.unwrap_or(DEFAULT_SESSION_TITLE).to_string(),
                created_at: now,
                updated_at: now,
            },
        };
        self.sessions
            .insert(session_id.as_bytes(), serde_json::to_vec(&record)?)?;
        Ok(record)
    }

    async fn insert_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
    ) -> Result<StoredMessage, PersistenceError> {
        let seq = self.db.generate_id()?;
        let message = StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        let key = format!("{}{seq:020}", Self::message_prefix(session_id));
        self.messages.insert(key.as_bytes(), serde_json::to_vec(&message)?)?;
        tracing::debug!(
            target: "chatgate::history",
            session_id,
            role = role.as_str(),
            "message stored"
        );
        Ok(message)
    }

    async fn list_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, PersistenceError> {
        let prefix = Self::message_prefix(session_id);
        let mut out = Vec::new();
        for entry in self.messages.scan_prefix(prefix.as_bytes()).take(limit) {
            let (_, value) = entry?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    async fn list_sessions(&self, limit: usize) -> Result<Vec<SessionRecord>, PersistenceError> {
        let mut sessions = Vec::new();
        for entry in self.sessions.iter() {
            let (_, value) = entry?;
            sessions.push(serde_json::from_slice::<SessionRecord>(&value)?);
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions.truncate(limit);
        Ok(sessions)
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool, PersistenceError> {
        let existed = self.sessions.remove(session_id.as_bytes())?.is_some();
        let prefix = Self::message_prefix(session_id);
        let keys: Vec<sled::IVec> = self
            .messages
            .scan_prefix(prefix.as_bytes())
            .keys()
            .collect::<Result<_, _>>()?;
        for key in &keys {
            self.messages.remove(key)?;
        }
        tracing::info!(
            target: "chatgate::history",
            session_id,
            removed_messages = keys.len(),
            "session deleted"
        );
        Ok(existed || !keys.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_come_back_in_insertion_order() {
        let store = SledHistoryStore::temporary().unwrap();
        store.insert_message("s1", Role::User, "first").await.unwrap();
        store.insert_message("s1", Role::Assistant, "second").await.unwrap();
        store.insert_message("s2", Role::User, "other").await.unwrap();

        let messages = store.list_messages("s1", 50).await.unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second"]);
        assert_eq!(store.list_messages("s1", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upsert_keeps_created_at_and_title() {
        let store = SledHistoryStore::temporary().unwrap();
        let created = store.upsert_session("s1", None).await.unwrap();
        assert_eq!(created.title, DEFAULT_SESSION_TITLE);
        let touched = store.upsert_session("s1", None).await.unwrap();
        assert_eq!(touched.created_at, created.created_at);
        assert!(touched.updated_at >= created.updated_at);
        let renamed = store.upsert_session("s1", Some("Budget review")).await.unwrap();
        assert_eq!(renamed.title, "Budget review");
    }

    #[tokio::test]
    async fn sessions_are_listed_newest_first() {
        let store = SledHistoryStore::temporary().unwrap();
        store.upsert_session("old", None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.upsert_session("new", None).await.unwrap();
        let sessions = store.list_sessions(20).await.unwrap();
        assert_eq!(sessions[0].id, "new");
        assert_eq!(store.list_sessions(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_session_and_messages() {
        let store = SledHistoryStore::temporary().unwrap();
        store.upsert_session("s1", None).await.unwrap();
        store.insert_message("s1", Role::User, "hi").await.unwrap();
        store.insert_message("s10", Role::User, "keep me").await.unwrap();

        assert!(store.delete_session("s1").await.unwrap());
        assert!(store.list_messages("s1", 50).await.unwrap().is_empty());
        assert_eq!(store.list_messages("s10", 50).await.unwrap().len(), 1);
        assert!(!store.delete_session("s1").await.unwrap());
    }
}
