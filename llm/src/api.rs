use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::LlmError;

#[derive(Copy, Clone, Debug, Deserialize, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[default]
    Assistant,
    System,
}

/// One entry of a model-ready transcript: plain role + text, already
/// projected down from whatever richer content the caller persists.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// Per-call generation settings. All fields optional; `validate` enforces
/// the accepted ranges before a request ever reaches a backend.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

impl CallSettings {
    pub fn validate(&self) -> Result<(), LlmError> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(LlmError::InvalidRequest(format!(
                    "temperature {t} outside 0..=2"
                )));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(LlmError::InvalidRequest(format!("topP {p} outside 0..=1")));
            }
        }
        if let Some(n) = self.max_output_tokens {
            if n == 0 {
                return Err(LlmError::InvalidRequest(
                    "maxOutputTokens must be a positive integer".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Token accounting reported by a backend.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A fully assembled generation request.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChatRequest {
    pub(crate) messages: Vec<ChatMessage>,
    pub(crate) system: Option<String>,
    pub(crate) settings: CallSettings,
    pub(crate) provider_options: BTreeMap<String, Value>,
}

impl ChatRequest {
    /// Build a request from an iterator of message references. Messages are
    /// cloned exactly once, here.
    pub fn new<'a>(messages: impl IntoIterator<Item = &'a ChatMessage>) -> Self {
        ChatRequest {
            messages: messages.into_iter().cloned().collect(),
            system: None,
            settings: CallSettings::default(),
            provider_options: BTreeMap::new(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_settings(mut self, settings: CallSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_provider_options(mut self, options: BTreeMap<String, Value>) -> Self {
        self.provider_options = options;
        self
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn system(&self) -> Option<&str> {
        self.system.as_deref()
    }

    pub fn settings(&self) -> &CallSettings {
        &self.settings
    }

    pub fn provider_options(&self) -> &BTreeMap<String, Value> {
        &self.provider_options
    }
}

/// One incremental fragment of streamed output. `usage` is only populated on
/// the fragment that carries the backend's final accounting.
#[derive(Clone, Debug, Default)]
pub struct ChatDelta {
    pub text: String,
    pub usage: Option<Usage>,
}

impl ChatDelta {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }

    pub fn usage(usage: Usage) -> Self {
        Self {
            text: String::new(),
            usage: Some(usage),
        }
    }
}

/// Result of a single-shot generation call.
#[derive(Clone, Debug)]
pub struct Completion {
    pub message: ChatMessage,
    pub usage: Option<Usage>,
}
