//! In-memory `SessionStore` backend.

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

use super::types::{Message, MessageId, Session, SessionId, UserId};
use super::{MessagePatch, SessionStore};

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Session>,
    messages: Vec<Message>,
}

/// Simple mutex-guarded store. Writes are serialized per process, which is
/// enough to satisfy the per-row write contract the engine relies on.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load_session(&self, id: &SessionId) -> Result<Option<Session>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner
            .sessions
            .get(id)
            .filter(|s| !s.is_deleted())
            .cloned())
    }

    async fn save_session(&self, session: &Session) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete_session(&self, id: &SessionId) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        match inner.sessions.get_mut(id) {
            Some(session) => {
                session.deleted_at = Some(Utc::now());
                session.updated_at = Utc::now();
                Ok(())
            }
            None => bail!("no such session: {id}"),
        }
    }

    async fn list_sessions(&self, owner: &UserId) -> Result<Vec<Session>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.owner_id == *owner && !s.is_deleted())
            .cloned()
            .collect();
        sessions.sort_by(|a, b| {
            let a_key = a.last_message_at.unwrap_or(a.created_at);
            let b_key = b.last_message_at.unwrap_or(b.created_at);
            b_key.cmp(&a_key)
        });
        Ok(sessions)
    }

    async fn append_message(&self, message: &Message) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.messages.push(message.clone());
        Ok(())
    }

    async fn update_message(&self, id: &MessageId, patch: MessagePatch) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let Some(message) = inner.messages.iter_mut().find(|m| m.id == *id) else {
            bail!("no such message: {id}");
        };

        if let Some(status) = patch.status {
            message.status = status;
        }
        if let Some(text) = patch.text {
            message.text = text;
        }
        if let Some(parts) = patch.parts {
            message.parts = parts;
        }
        if let Some(tokens) = patch.tokens_used {
            message.tokens_used = Some(tokens);
        }
        if let Some(error) = patch.error_message {
            message.error_message = Some(error);
        }
        message.updated_at = Utc::now();
        Ok(())
    }

    async fn list_messages(&self, session_id: &SessionId) -> Result<Vec<Message>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut messages: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.session_id == *session_id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for exact ties within one role.
        messages.sort_by_key(|m| (m.created_at, m.role_rank()));
        Ok(messages)
    }
}
