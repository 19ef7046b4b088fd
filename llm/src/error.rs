//! Closed error taxonomy for the generation boundary.
//!
//! Backends and the engine produce `LlmError` sentinel values; `classify`
//! folds any `anyhow::Error` into a `Classified` record (category + retryable
//! flag) with an explicit `unknown` fallback for foreign error types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of error categories crossing the stream boundary.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    InvalidInput,
    InvalidResponse,
    Auth,
    RateLimit,
    Network,
    Unknown,
}

impl ErrorCategory {
    pub fn retryable(&self) -> bool {
        match self {
            ErrorCategory::InvalidInput | ErrorCategory::Auth => false,
            ErrorCategory::InvalidResponse
            | ErrorCategory::RateLimit
            | ErrorCategory::Network
            | ErrorCategory::Unknown => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::InvalidInput => "invalid-input",
            ErrorCategory::InvalidResponse => "invalid-response",
            ErrorCategory::Auth => "auth",
            ErrorCategory::RateLimit => "rate-limit",
            ErrorCategory::Network => "network",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sentinel error kinds produced at the generation boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmError {
    /// Malformed prompt or out-of-range call settings.
    InvalidRequest(String),
    /// Empty user message.
    EmptyMessage,
    /// No registered resolver produced a handle for this identifier.
    UnknownModel(String),
    /// Backend returned no usable output.
    EmptyResponse,
    /// Backend output could not be decoded.
    MalformedResponse(String),
    /// Missing or rejected credentials.
    MissingCredentials(String),
    /// The backend does not support the requested capability.
    Unsupported(String),
    /// Quota exhausted or too many in-flight requests.
    RateLimited(String),
    /// A stream is already active for this session.
    Busy(String),
    /// Transport-level call failure.
    Network(String),
}

impl LlmError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            LlmError::InvalidRequest(_) | LlmError::EmptyMessage | LlmError::UnknownModel(_) => {
                ErrorCategory::InvalidInput
            }
            LlmError::EmptyResponse | LlmError::MalformedResponse(_) => {
                ErrorCategory::InvalidResponse
            }
            LlmError::MissingCredentials(_) | LlmError::Unsupported(_) => ErrorCategory::Auth,
            LlmError::RateLimited(_) | LlmError::Busy(_) => ErrorCategory::RateLimit,
            LlmError::Network(_) => ErrorCategory::Network,
        }
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            LlmError::EmptyMessage => write!(f, "Message must not be empty"),
            LlmError::UnknownModel(id) => write!(f, "No resolver matched model id: {}", id),
            LlmError::EmptyResponse => write!(f, "Backend returned an empty response"),
            LlmError::MalformedResponse(msg) => write!(f, "Unparsable backend response: {}", msg),
            LlmError::MissingCredentials(msg) => write!(f, "Missing credentials: {}", msg),
            LlmError::Unsupported(msg) => write!(f, "Unsupported capability: {}", msg),
            LlmError::RateLimited(msg) => write!(f, "Rate limited: {}", msg),
            LlmError::Busy(msg) => write!(f, "Busy: {}", msg),
            LlmError::Network(msg) => write!(f, "Network failure: {}", msg),
        }
    }
}

impl std::error::Error for LlmError {}

/// Classification result crossing the stream boundary as an `error` event.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Classified {
    pub category: ErrorCategory,
    pub message: String,
    pub retryable: bool,
}

/// Fold an arbitrary error into the closed taxonomy. Total: anything that is
/// not an `LlmError` sentinel lands in `unknown`, which is retryable.
pub fn classify(err: &anyhow::Error) -> Classified {
    let category = match err.downcast_ref::<LlmError>() {
        Some(sentinel) => sentinel.category(),
        None => ErrorCategory::Unknown,
    };
    Classified {
        category,
        message: err.to_string(),
        retryable: category.retryable(),
    }
}
