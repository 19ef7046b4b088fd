//! Core chat streaming pipeline: sessions, messages, the turn engine and the
//! event vocabulary it speaks.
//!
//! The `llm` crate supplies model resolution and the generation boundary; the
//! `sse` crate carries the events over the wire. This crate sits between the
//! two: it persists the conversation, drives one generation per turn and
//! emits the ordered `StreamEvent` sequence clients fold with [`Timeline`].

pub mod engine;
pub mod event;
pub mod request;
pub mod storage;
pub mod timeline;

pub use engine::{ChatStreamEngine, EngineConfig, StreamHandle};
pub use event::StreamEvent;
pub use request::{MAX_SYSTEM_PROMPT_CHARS, SendMessageRequest};
pub use storage::{
    Message, MessageId, MessagePart, MessagePatch, MessageStatus, MemoryStore, Session, SessionId,
    SessionMode, SessionStore, UserId, Visibility,
};
pub use timeline::{Timeline, TimelinePhase};

use std::time::Duration;

/// Map persisted transport settings onto the resumable consumer's options.
pub fn consumer_options(settings: &config::TransportSettings) -> sse::ConsumerOptions {
    sse::ConsumerOptions {
        retryable_statuses: settings.retryable_statuses.clone(),
        max_attempts: settings.max_attempts,
        initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
        max_backoff: Duration::from_millis(settings.max_backoff_ms),
    }
}
