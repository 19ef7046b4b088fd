//! Client-side fold of a stream into a renderable view.
//!
//! A consumer that replays a stream (fresh or resumed) feeds every event
//! through `Timeline::apply` and renders the result after each step.

use llm::{Classified, Usage};

use crate::event::StreamEvent;
use crate::storage::{MessageId, SessionId};

/// Where the folded stream currently stands.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum TimelinePhase {
    #[default]
    Waiting,
    Streaming,
    Completed,
    Failed,
}

/// Accumulated view of one generation stream.
#[derive(Clone, Debug, Default)]
pub struct Timeline {
    pub session_id: Option<SessionId>,
    pub user_message_id: Option<MessageId>,
    pub assistant_message_id: Option<MessageId>,
    pub text: String,
    pub usage: Option<Usage>,
    pub total_usage: Option<u32>,
    pub error: Option<Classified>,
    pub phase: TimelinePhase,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event. Events after a terminal one are ignored; a server
    /// that honors the ordering contract never produces any.
    pub fn apply(&mut self, event: StreamEvent) {
        if self.is_terminal() {
            return;
        }
        match event {
            StreamEvent::Session { session_id } => {
                self.session_id = Some(session_id);
            }
            StreamEvent::UserMessage { message_id } => {
                self.user_message_id = Some(message_id);
            }
            StreamEvent::AssistantStart { message_id } => {
                self.assistant_message_id = Some(message_id);
                self.phase = TimelinePhase::Streaming;
            }
            StreamEvent::AssistantDelta { delta, .. } => {
                self.text.push_str(&delta);
            }
            StreamEvent::AssistantEnd {
                text,
                usage,
                total_usage,
                ..
            } => {
                // The terminal text is authoritative over the concatenation.
                self.text = text;
                self.usage = usage;
                self.total_usage = total_usage;
                self.phase = TimelinePhase::Completed;
            }
            StreamEvent::Error {
                message,
                category,
                retryable,
            } => {
                self.error = Some(Classified {
                    category,
                    message,
                    retryable,
                });
                self.phase = TimelinePhase::Failed;
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, TimelinePhase::Completed | TimelinePhase::Failed)
    }
}
