use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod api;
pub mod error;
pub mod registry;

pub use api::*;
pub use error::{Classified, ErrorCategory, LlmError, classify};
pub use registry::{ModelRef, ModelRegistry, Resolver};

/// Stream of incremental generation output. Items are fallible so a backend
/// can surface a mid-stream failure without tearing down the whole call path.
pub type ChatStream = Pin<Box<dyn Stream<Item = anyhow::Result<ChatDelta>> + Send>>;

/// A resolved, invokable generation backend.
pub type ModelHandle = Arc<dyn ChatModel + Send + Sync>;

impl std::fmt::Debug for dyn ChatModel + Send + Sync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatModel").field("id", &self.id()).finish()
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Stable identifier for this model (what the registry resolved).
    fn id(&self) -> &str;

    /// Single-shot generation.
    async fn chat(&self, request: &ChatRequest) -> anyhow::Result<Completion>;

    /// Streaming generation. The backend must stop producing deltas and
    /// release its resources once `cancel` fires.
    async fn stream_chat(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChatStream>;
}
