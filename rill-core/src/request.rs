//! Inbound send-message payload and its validation.

use llm::{CallSettings, LlmError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::storage::SessionId;

/// Maximum accepted system prompt length, in characters.
pub const MAX_SYSTEM_PROMPT_CHARS: usize = 4000;

/// One user turn. `session_id` absent means "start a new session".
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_settings: Option<CallSettings>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provider_options: BTreeMap<String, Value>,
}

impl SendMessageRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn session(mut self, id: SessionId) -> Self {
        self.session_id = Some(id);
        self
    }

    pub fn model(mut self, id: impl Into<String>) -> Self {
        self.model_id = Some(id.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn call_settings(mut self, settings: CallSettings) -> Self {
        self.call_settings = Some(settings);
        self
    }

    /// Reject the request before anything touches the store or a backend.
    pub fn validate(&self) -> Result<(), LlmError> {
        if self.message.trim().is_empty() {
            return Err(LlmError::EmptyMessage);
        }
        if let Some(prompt) = &self.system_prompt {
            if prompt.chars().count() > MAX_SYSTEM_PROMPT_CHARS {
                return Err(LlmError::InvalidRequest(format!(
                    "system prompt exceeds {MAX_SYSTEM_PROMPT_CHARS} characters"
                )));
            }
        }
        if let Some(settings) = &self.call_settings {
            settings.validate()?;
        }
        Ok(())
    }
}
