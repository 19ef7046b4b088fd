//! Durable session/message types and their type-safe IDs.

use chrono::{DateTime, Utc};
use llm::Role;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Macro to define a type-safe ID newtype
macro_rules! define_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Get the inner string value
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

define_id!(SessionId, "Identifies a chat session");
define_id!(MessageId, "Identifies a message within a session");
define_id!(UserId, "Identifies the owning user (verified upstream)");

/// Who may see a session.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Shared,
}

/// What kind of exchange a session holds.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    #[default]
    Chat,
    Image,
}

/// Maximum length of an inferred session title, in characters.
pub const TITLE_MAX_CHARS: usize = 40;

/// A durable conversation thread. Owned by exactly one user; mutated on every
/// message exchange; soft-deleted via `deleted_at`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub owner_id: UserId,
    pub title: Option<String>,
    pub system_prompt: Option<String>,
    pub model_id: String,
    pub visibility: Visibility,
    pub mode: SessionMode,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(owner_id: UserId, model_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            owner_id,
            title: None,
            system_prompt: None,
            model_id: model_id.into(),
            visibility: Visibility::Private,
            mode: SessionMode::Chat,
            last_message_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Title inferred from the first message: its leading characters.
    pub fn infer_title(message: &str) -> String {
        message.trim().chars().take(TITLE_MAX_CHARS).collect()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Message lifecycle. `Completed` and `Failed` are terminal: a message never
/// re-enters `Streaming` once it reaches either.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Streaming,
    Completed,
    Failed,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Completed | MessageStatus::Failed)
    }
}

/// One typed piece of message content.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessagePart {
    Text { text: String },
    File { name: String, media_type: String, url: String },
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text { text: text.into() }
    }
}

/// Join the text parts into the denormalized plain-text projection.
pub fn parts_text(parts: &[MessagePart]) -> String {
    parts
        .iter()
        .filter_map(|part| match part {
            MessagePart::Text { text } => Some(text.as_str()),
            MessagePart::File { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

/// A persisted message row. Ordered within a session by `created_at`, ties
/// broken by role (user sorts before assistant).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Message {
    pub id: MessageId,
    pub session_id: SessionId,
    pub author_id: Option<UserId>,
    pub role: Role,
    pub status: MessageStatus,
    pub parts: Vec<MessagePart>,
    pub text: String,
    pub tokens_used: Option<u32>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// A user message: persisted already completed.
    pub fn user(session_id: &SessionId, author_id: &UserId, parts: Vec<MessagePart>) -> Self {
        let now = Utc::now();
        let text = parts_text(&parts);
        Self {
            id: MessageId::new(),
            session_id: session_id.clone(),
            author_id: Some(author_id.clone()),
            role: Role::User,
            status: MessageStatus::Completed,
            parts,
            text,
            tokens_used: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The in-flight assistant placeholder: empty content, `streaming` status.
    pub fn assistant_placeholder(session_id: &SessionId) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId::new(),
            session_id: session_id.clone(),
            author_id: None,
            role: Role::Assistant,
            status: MessageStatus::Streaming,
            parts: Vec::new(),
            text: String::new(),
            tokens_used: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Tie-break rank for equal timestamps: user before assistant.
    pub fn role_rank(&self) -> u8 {
        match self.role {
            Role::System => 0,
            Role::User => 1,
            Role::Assistant => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inferred_title_is_capped_at_forty_chars() {
        let long = "x".repeat(100);
        assert_eq!(Session::infer_title(&long).chars().count(), 40);
        assert_eq!(Session::infer_title("  hello  "), "hello");
    }

    #[test]
    fn inferred_title_respects_char_boundaries() {
        let message = "é".repeat(60);
        let title = Session::infer_title(&message);
        assert_eq!(title.chars().count(), 40);
    }

    #[test]
    fn terminal_statuses() {
        assert!(MessageStatus::Completed.is_terminal());
        assert!(MessageStatus::Failed.is_terminal());
        assert!(!MessageStatus::Pending.is_terminal());
        assert!(!MessageStatus::Streaming.is_terminal());
    }

    #[test]
    fn text_projection_skips_file_parts() {
        let parts = vec![
            MessagePart::text("see "),
            MessagePart::File {
                name: "report.pdf".to_string(),
                media_type: "application/pdf".to_string(),
                url: "blob://report".to_string(),
            },
            MessagePart::text("attached"),
        ];
        assert_eq!(parts_text(&parts), "see attached");
    }

    #[test]
    fn user_message_is_born_completed() {
        let session = SessionId::new();
        let author = UserId::new();
        let message = Message::user(&session, &author, vec![MessagePart::text("hi")]);
        assert_eq!(message.status, MessageStatus::Completed);
        assert_eq!(message.text, "hi");
        assert_eq!(message.role, Role::User);
    }

    #[test]
    fn placeholder_is_streaming_and_empty() {
        let session = SessionId::new();
        let message = Message::assistant_placeholder(&session);
        assert_eq!(message.status, MessageStatus::Streaming);
        assert!(message.text.is_empty());
        assert!(message.author_id.is_none());
    }

    #[test]
    fn message_part_wire_shape() {
        let json = serde_json::to_string(&MessagePart::text("hi")).unwrap();
        assert_eq!(json, "{\"type\":\"text\",\"text\":\"hi\"}");
    }
}
