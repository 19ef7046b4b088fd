//! Persistence seam for sessions and messages.
//!
//! The relational backend lives outside this repo; everything here talks to
//! the `SessionStore` trait. `MemoryStore` is the in-process implementation
//! used by tests and local development.

pub mod memory;
pub mod types;

pub use memory::MemoryStore;
pub use types::{
    Message, MessageId, MessagePart, MessageStatus, Session, SessionId, SessionMode, UserId,
    Visibility, parts_text,
};

use anyhow::Result;
use async_trait::async_trait;

/// Partial update applied to an existing message row. Unset fields are left
/// untouched; `updated_at` is bumped by the store.
#[derive(Clone, Debug, Default)]
pub struct MessagePatch {
    pub status: Option<MessageStatus>,
    pub text: Option<String>,
    pub parts: Option<Vec<MessagePart>>,
    pub tokens_used: Option<u32>,
    pub error_message: Option<String>,
}

impl MessagePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: MessageStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        self.parts = Some(vec![MessagePart::text(text.clone())]);
        self.text = Some(text);
        self
    }

    pub fn tokens_used(mut self, tokens: u32) -> Self {
        self.tokens_used = Some(tokens);
        self
    }

    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a session by id. Soft-deleted sessions resolve to `None`.
    async fn load_session(&self, id: &SessionId) -> Result<Option<Session>>;

    /// Insert or update a session.
    async fn save_session(&self, session: &Session) -> Result<()>;

    /// Soft-delete a session.
    async fn delete_session(&self, id: &SessionId) -> Result<()>;

    /// Live sessions owned by `owner`, most recently active first.
    async fn list_sessions(&self, owner: &UserId) -> Result<Vec<Session>>;

    /// Append a new message row.
    async fn append_message(&self, message: &Message) -> Result<()>;

    /// Apply a partial update to a message.
    async fn update_message(&self, id: &MessageId, patch: MessagePatch) -> Result<()>;

    /// All messages of a session, ascending by `created_at` with ties broken
    /// user-before-assistant.
    async fn list_messages(&self, session_id: &SessionId) -> Result<Vec<Message>>;
}
