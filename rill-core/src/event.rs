//! Events emitted over a generation stream, in order:
//! `session`, `user-message`, `assistant-start`, zero or more
//! `assistant-delta`, then exactly one of `assistant-end` or `error`.

use llm::{ErrorCategory, Usage};
use serde::{Deserialize, Serialize};

use crate::storage::{MessageId, SessionId};

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    /// The session this stream belongs to. Always first, so a client that
    /// sent no session id learns the one that was created for it.
    #[serde(rename_all = "camelCase")]
    Session { session_id: SessionId },

    /// The persisted user message.
    #[serde(rename_all = "camelCase")]
    UserMessage { message_id: MessageId },

    /// The assistant placeholder row exists; deltas follow.
    #[serde(rename_all = "camelCase")]
    AssistantStart { message_id: MessageId },

    /// One incremental text fragment. Never empty.
    #[serde(rename_all = "camelCase")]
    AssistantDelta { message_id: MessageId, delta: String },

    /// Terminal success. `text` is the full accumulated reply, `usage` this
    /// generation's accounting, `total_usage` the session's running token sum.
    #[serde(rename_all = "camelCase")]
    AssistantEnd {
        message_id: MessageId,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_usage: Option<u32>,
    },

    /// Terminal failure, already folded into the closed taxonomy.
    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        category: ErrorCategory,
        retryable: bool,
    },
}

impl StreamEvent {
    /// `assistant-end` and `error` close the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::AssistantEnd { .. } | StreamEvent::Error { .. }
        )
    }
}
