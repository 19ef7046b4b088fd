//! Orchestrates one user turn: session setup, persistence, model streaming
//! and the ordered event stream the client renders from.
//!
//! A turn moves through a fixed sequence. The session is loaded or created,
//! the user message persisted, then a background task drives the model
//! stream, folding deltas into the assistant row as they arrive. At most one
//! stream may be active per session; a second send is rejected outright.

use anyhow::Result;
use llm::{ChatMessage, ChatRequest, LlmError, ModelHandle, ModelRegistry, Usage, classify};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::event::StreamEvent;
use crate::request::SendMessageRequest;
use crate::storage::{
    Message, MessagePart, MessagePatch, MessageStatus, Session, SessionId, SessionStore, UserId,
};

/// Engine-level knobs.
#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    /// Model used for new sessions when the request names none.
    pub default_model_id: Option<String>,
}

impl EngineConfig {
    pub fn from_settings(settings: &config::Settings) -> Self {
        Self {
            default_model_id: settings.default_model.clone(),
        }
    }
}

/// Live handle on an in-flight turn. Dropping it does not stop generation;
/// call `cancel` for that.
#[derive(Debug)]
pub struct StreamHandle {
    session_id: SessionId,
    events: UnboundedReceiver<StreamEvent>,
    cancel: CancellationToken,
}

impl StreamHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Next event, or `None` once the generation task has finished and all
    /// its persistence writes are durable.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Stop generation. The partial reply persists as a failed message and
    /// no further events are delivered.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Releases the per-session slot when the generation task ends, however it
/// ends.
struct SessionLease {
    active: Arc<Mutex<HashSet<SessionId>>>,
    session_id: SessionId,
}

impl SessionLease {
    fn acquire(
        active: &Arc<Mutex<HashSet<SessionId>>>,
        session_id: &SessionId,
    ) -> Result<Self, LlmError> {
        let mut held = active.lock().expect("lease lock poisoned");
        if !held.insert(session_id.clone()) {
            return Err(LlmError::Busy(format!(
                "a stream is already active for session {session_id}"
            )));
        }
        Ok(Self {
            active: active.clone(),
            session_id: session_id.clone(),
        })
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Ok(mut held) = self.active.lock() {
            held.remove(&self.session_id);
        }
    }
}

pub struct ChatStreamEngine {
    store: Arc<dyn SessionStore>,
    registry: Arc<ModelRegistry>,
    config: EngineConfig,
    active: Arc<Mutex<HashSet<SessionId>>>,
}

impl ChatStreamEngine {
    pub fn new(
        store: Arc<dyn SessionStore>,
        registry: Arc<ModelRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run one user turn. Validation, session resolution and model lookup
    /// happen here, synchronously; everything after the returned handle is
    /// delivered as events.
    pub async fn send_message(
        &self,
        owner: &UserId,
        request: SendMessageRequest,
    ) -> Result<StreamHandle> {
        request.validate()?;

        let mut session = self.resolve_session(owner, &request).await?;
        let model = self.registry.resolve(session.model_id.as_str())?;

        // Taken before the user row is written so a rejected send leaves no
        // dangling message behind.
        let lease = SessionLease::acquire(&self.active, &session.id)?;

        let user_message = Message::user(
            &session.id,
            owner,
            vec![MessagePart::text(request.message.trim())],
        );
        self.store.append_message(&user_message).await?;

        if session.title.is_none() {
            session.title = Some(Session::infer_title(&request.message));
        }
        session.last_message_at = Some(user_message.created_at);
        session.updated_at = user_message.created_at;
        self.store.save_session(&session).await?;

        let (tx, events) = mpsc::unbounded_channel();
        emit(
            &tx,
            StreamEvent::Session {
                session_id: session.id.clone(),
            },
        );
        emit(
            &tx,
            StreamEvent::UserMessage {
                message_id: user_message.id.clone(),
            },
        );

        let cancel = CancellationToken::new();
        let handle = StreamHandle {
            session_id: session.id.clone(),
            events,
            cancel: cancel.clone(),
        };

        let store = self.store.clone();
        tokio::spawn(async move {
            run_generation(store, model, session, request, tx, cancel).await;
            drop(lease);
        });

        Ok(handle)
    }

    /// Sessions owned by `owner`, most recently active first.
    pub async fn list_sessions(&self, owner: &UserId) -> Result<Vec<Session>> {
        self.store.list_sessions(owner).await
    }

    /// Soft-delete a session. An in-flight stream on it is left to finish.
    pub async fn delete_session(&self, owner: &UserId, id: &SessionId) -> Result<()> {
        let session = self
            .store
            .load_session(id)
            .await?
            .filter(|s| s.owner_id == *owner)
            .ok_or_else(|| LlmError::InvalidRequest(format!("no such session: {id}")))?;
        self.store.delete_session(&session.id).await
    }

    /// Load an existing session (checking ownership and applying request
    /// overrides) or assemble a fresh one.
    async fn resolve_session(
        &self,
        owner: &UserId,
        request: &SendMessageRequest,
    ) -> Result<Session> {
        match &request.session_id {
            Some(id) => {
                let mut session = self
                    .store
                    .load_session(id)
                    .await?
                    .filter(|s| s.owner_id == *owner)
                    .ok_or_else(|| LlmError::InvalidRequest(format!("no such session: {id}")))?;
                if let Some(model_id) = &request.model_id {
                    session.model_id = model_id.clone();
                }
                if let Some(prompt) = &request.system_prompt {
                    session.system_prompt = Some(prompt.clone());
                }
                Ok(session)
            }
            None => {
                let model_id = request
                    .model_id
                    .clone()
                    .or_else(|| self.config.default_model_id.clone())
                    .ok_or_else(|| {
                        LlmError::InvalidRequest(
                            "no model id given and no default configured".to_string(),
                        )
                    })?;
                let mut session = Session::new(owner.clone(), model_id);
                session.system_prompt = request.system_prompt.clone();
                Ok(session)
            }
        }
    }
}

fn emit(tx: &UnboundedSender<StreamEvent>, event: StreamEvent) {
    // The receiver may be gone; generation keeps running so the row still
    // reaches a terminal state.
    let _ = tx.send(event);
}

/// Completed rows of the session, projected into a model transcript.
fn build_transcript(messages: &[Message]) -> Vec<ChatMessage> {
    messages
        .iter()
        .filter(|m| m.status == MessageStatus::Completed && !m.text.is_empty())
        .map(|m| ChatMessage::new(m.role, m.text.clone()))
        .collect()
}

async fn run_generation(
    store: Arc<dyn SessionStore>,
    model: ModelHandle,
    mut session: Session,
    request: SendMessageRequest,
    tx: UnboundedSender<StreamEvent>,
    cancel: CancellationToken,
) {
    use futures::StreamExt;

    let history = match store.list_messages(&session.id).await {
        Ok(messages) => messages,
        Err(err) => {
            fail(&store, &tx, None, String::new(), &err).await;
            return;
        }
    };
    let transcript = build_transcript(&history);

    let placeholder = Message::assistant_placeholder(&session.id);
    if let Err(err) = store.append_message(&placeholder).await {
        fail(&store, &tx, None, String::new(), &err).await;
        return;
    }
    emit(
        &tx,
        StreamEvent::AssistantStart {
            message_id: placeholder.id.clone(),
        },
    );

    let mut chat_request =
        ChatRequest::new(&transcript).with_settings(request.call_settings.unwrap_or_default());
    if let Some(prompt) = &session.system_prompt {
        chat_request = chat_request.with_system(prompt.clone());
    }
    if !request.provider_options.is_empty() {
        chat_request = chat_request.with_provider_options(request.provider_options);
    }

    let mut stream = match model.stream_chat(&chat_request, cancel.clone()).await {
        Ok(stream) => stream,
        Err(err) => {
            fail(&store, &tx, Some(&placeholder), String::new(), &err).await;
            return;
        }
    };

    debug!(session = %session.id, model = model.id(), "assistant stream open");

    let mut acc = String::new();
    let mut usage: Option<Usage> = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Cancellation is silent: the partial text persists as a
                // failed row and the stream just ends.
                debug!(session = %session.id, "stream cancelled");
                persist_terminal(
                    &store,
                    &placeholder,
                    MessagePatch::new()
                        .status(MessageStatus::Failed)
                        .text(acc)
                        .error_message("cancelled"),
                )
                .await;
                return;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(delta)) => {
                if let Some(reported) = delta.usage {
                    usage = Some(reported);
                }
                if !delta.text.is_empty() {
                    acc.push_str(&delta.text);
                    emit(
                        &tx,
                        StreamEvent::AssistantDelta {
                            message_id: placeholder.id.clone(),
                            delta: delta.text,
                        },
                    );
                }
            }
            Some(Err(err)) => {
                fail(&store, &tx, Some(&placeholder), acc, &err).await;
                return;
            }
            None => break,
        }
    }

    if acc.is_empty() {
        let err = anyhow::Error::new(LlmError::EmptyResponse);
        fail(&store, &tx, Some(&placeholder), acc, &err).await;
        return;
    }

    let mut patch = MessagePatch::new()
        .status(MessageStatus::Completed)
        .text(acc.clone());
    if let Some(usage) = &usage {
        patch = patch.tokens_used(usage.total_tokens);
    }
    persist_terminal(&store, &placeholder, patch).await;

    session.last_message_at = Some(chrono::Utc::now());
    session.updated_at = chrono::Utc::now();
    if let Err(err) = store.save_session(&session).await {
        error!(session = %session.id, %err, "failed to bump session after stream");
    }

    let total_usage = match store.list_messages(&session.id).await {
        Ok(messages) => {
            let total: u32 = messages.iter().filter_map(|m| m.tokens_used).sum();
            (total > 0).then_some(total)
        }
        Err(err) => {
            warn!(session = %session.id, %err, "could not total session usage");
            None
        }
    };

    emit(
        &tx,
        StreamEvent::AssistantEnd {
            message_id: placeholder.id.clone(),
            text: acc,
            usage,
            total_usage,
        },
    );
}

/// Mark the stream failed: persist the partial text on the placeholder (when
/// one exists) and emit the single terminal `error` event.
async fn fail(
    store: &Arc<dyn SessionStore>,
    tx: &UnboundedSender<StreamEvent>,
    placeholder: Option<&Message>,
    partial: String,
    err: &anyhow::Error,
) {
    let classified = classify(err);
    warn!(
        category = classified.category.as_str(),
        retryable = classified.retryable,
        "stream failed: {}",
        classified.message
    );

    if let Some(placeholder) = placeholder {
        persist_terminal(
            store,
            placeholder,
            MessagePatch::new()
                .status(MessageStatus::Failed)
                .text(partial)
                .error_message(classified.message.clone()),
        )
        .await;
    }

    emit(
        tx,
        StreamEvent::Error {
            message: classified.message,
            category: classified.category,
            retryable: classified.retryable,
        },
    );
}

async fn persist_terminal(store: &Arc<dyn SessionStore>, message: &Message, patch: MessagePatch) {
    if let Err(err) = store.update_message(&message.id, patch).await {
        error!(message = %message.id, %err, "failed to persist terminal message state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use futures::stream;
    use futures::StreamExt;
    use llm::{ChatDelta, ChatModel, ChatStream, Completion, ErrorCategory};

    /// Replays a fixed script of deltas, once.
    struct ScriptedModel {
        id: String,
        script: Mutex<Option<Vec<anyhow::Result<ChatDelta>>>>,
    }

    impl ScriptedModel {
        fn new(id: &str, script: Vec<anyhow::Result<ChatDelta>>) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                script: Mutex::new(Some(script)),
            })
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        fn id(&self) -> &str {
            &self.id
        }

        async fn chat(&self, _request: &ChatRequest) -> anyhow::Result<Completion> {
            anyhow::bail!("not used in these tests")
        }

        async fn stream_chat(
            &self,
            _request: &ChatRequest,
            _cancel: CancellationToken,
        ) -> anyhow::Result<ChatStream> {
            let script = self.script.lock().unwrap().take().expect("script replayed");
            Ok(Box::pin(stream::iter(script)))
        }
    }

    /// Yields its deltas then hangs until cancelled.
    struct HangingModel {
        id: String,
        prefix: Vec<String>,
    }

    #[async_trait]
    impl ChatModel for HangingModel {
        fn id(&self) -> &str {
            &self.id
        }

        async fn chat(&self, _request: &ChatRequest) -> anyhow::Result<Completion> {
            anyhow::bail!("not used in these tests")
        }

        async fn stream_chat(
            &self,
            _request: &ChatRequest,
            _cancel: CancellationToken,
        ) -> anyhow::Result<ChatStream> {
            let head: Vec<anyhow::Result<ChatDelta>> =
                self.prefix.iter().map(|t| Ok(ChatDelta::text(t))).collect();
            Ok(Box::pin(stream::iter(head).chain(stream::pending())))
        }
    }

    fn engine_with(model: ModelHandle) -> (ChatStreamEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ModelRegistry::new());
        let id = model.id().to_string();
        registry.register("test", move |requested: &str| {
            (requested == id).then(|| model.clone())
        });
        let engine = ChatStreamEngine::new(store.clone(), registry, EngineConfig::default());
        (engine, store)
    }

    async fn drain(handle: &mut StreamHandle) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.next().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn successful_turn_emits_ordered_events_and_persists() {
        let model = ScriptedModel::new(
            "gpt-4o",
            vec![
                Ok(ChatDelta::text("Hel")),
                Ok(ChatDelta::text("lo")),
                Ok(ChatDelta::usage(Usage::new(4, 2))),
            ],
        );
        let (engine, store) = engine_with(model);
        let owner = UserId::new();

        let mut handle = engine
            .send_message(&owner, SendMessageRequest::new("Say hello").model("gpt-4o"))
            .await
            .unwrap();
        let events = drain(&mut handle).await;

        assert!(matches!(events[0], StreamEvent::Session { .. }));
        assert!(matches!(events[1], StreamEvent::UserMessage { .. }));
        assert!(matches!(events[2], StreamEvent::AssistantStart { .. }));
        assert!(matches!(events[3], StreamEvent::AssistantDelta { .. }));
        assert!(matches!(events[4], StreamEvent::AssistantDelta { .. }));
        let StreamEvent::AssistantEnd {
            text, total_usage, ..
        } = &events[5]
        else {
            panic!("expected assistant-end, got {:?}", events[5]);
        };
        assert_eq!(text, "Hello");
        assert_eq!(*total_usage, Some(6));

        let messages = store.list_messages(handle.session_id()).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].status, MessageStatus::Completed);
        assert_eq!(messages[1].text, "Hello");
        assert_eq!(messages[1].tokens_used, Some(6));

        let session = store
            .load_session(handle.session_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.title.as_deref(), Some("Say hello"));
        assert!(session.last_message_at.is_some());
    }

    #[tokio::test]
    async fn mid_stream_failure_keeps_partial_text() {
        let model = ScriptedModel::new(
            "gpt-4o",
            vec![
                Ok(ChatDelta::text("par")),
                Err(anyhow::Error::new(LlmError::Network("reset".into()))),
            ],
        );
        let (engine, store) = engine_with(model);
        let owner = UserId::new();

        let mut handle = engine
            .send_message(&owner, SendMessageRequest::new("hi").model("gpt-4o"))
            .await
            .unwrap();
        let events = drain(&mut handle).await;

        let StreamEvent::Error {
            category,
            retryable,
            ..
        } = events.last().unwrap()
        else {
            panic!("expected terminal error event");
        };
        assert_eq!(*category, ErrorCategory::Network);
        assert!(*retryable);

        let messages = store.list_messages(handle.session_id()).await.unwrap();
        assert_eq!(messages[1].status, MessageStatus::Failed);
        assert_eq!(messages[1].text, "par");
        assert!(messages[1].error_message.is_some());
    }

    #[tokio::test]
    async fn empty_stream_fails_as_invalid_response() {
        let model = ScriptedModel::new("gpt-4o", vec![]);
        let (engine, store) = engine_with(model);
        let owner = UserId::new();

        let mut handle = engine
            .send_message(&owner, SendMessageRequest::new("hi").model("gpt-4o"))
            .await
            .unwrap();
        let events = drain(&mut handle).await;

        let StreamEvent::Error { category, .. } = events.last().unwrap() else {
            panic!("expected terminal error event");
        };
        assert_eq!(*category, ErrorCategory::InvalidResponse);

        let messages = store.list_messages(handle.session_id()).await.unwrap();
        assert_eq!(messages[1].status, MessageStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_model_is_rejected_synchronously() {
        let store = Arc::new(MemoryStore::new());
        let engine = ChatStreamEngine::new(
            store.clone(),
            Arc::new(ModelRegistry::new()),
            EngineConfig::default(),
        );
        let owner = UserId::new();

        let err = engine
            .send_message(&owner, SendMessageRequest::new("hi").model("nope"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LlmError>(),
            Some(LlmError::UnknownModel(_))
        ));
        // Nothing was persisted.
        assert!(store.list_sessions(&owner).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_send_on_active_session_is_busy() {
        let model: ModelHandle = Arc::new(HangingModel {
            id: "gpt-4o".to_string(),
            prefix: vec![],
        });
        let (engine, _store) = engine_with(model);
        let owner = UserId::new();

        let mut first = engine
            .send_message(&owner, SendMessageRequest::new("hi").model("gpt-4o"))
            .await
            .unwrap();
        let session_id = first.session_id().clone();

        // Wait for the stream to actually open.
        assert!(matches!(
            first.next().await,
            Some(StreamEvent::Session { .. })
        ));

        let err = engine
            .send_message(
                &owner,
                SendMessageRequest::new("again").session(session_id),
            )
            .await
            .unwrap_err();
        let classified = classify(&err);
        assert_eq!(classified.category, ErrorCategory::RateLimit);
        assert!(classified.retryable);

        first.cancel();
        drain(&mut first).await;
    }

    #[tokio::test]
    async fn cancellation_persists_partial_as_failed_without_terminal_event() {
        let model: ModelHandle = Arc::new(HangingModel {
            id: "gpt-4o".to_string(),
            prefix: vec!["par".to_string()],
        });
        let (engine, store) = engine_with(model);
        let owner = UserId::new();

        let mut handle = engine
            .send_message(&owner, SendMessageRequest::new("hi").model("gpt-4o"))
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = handle.next().await {
            let is_delta = matches!(event, StreamEvent::AssistantDelta { .. });
            events.push(event);
            if is_delta {
                handle.cancel();
            }
        }

        assert!(!events.iter().any(StreamEvent::is_terminal));

        let messages = store.list_messages(handle.session_id()).await.unwrap();
        assert_eq!(messages[1].status, MessageStatus::Failed);
        assert_eq!(messages[1].text, "par");
        assert_eq!(messages[1].error_message.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn follow_up_turn_reuses_session_and_appends() {
        let owner = UserId::new();
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ModelRegistry::new());
        let engine = ChatStreamEngine::new(store.clone(), registry.clone(), EngineConfig::default());

        let first = ScriptedModel::new("gpt-4o", vec![Ok(ChatDelta::text("one"))]);
        registry.register("test", {
            let first = first.clone();
            move |requested: &str| (requested == "gpt-4o").then(|| first.clone() as ModelHandle)
        });

        let mut handle = engine
            .send_message(&owner, SendMessageRequest::new("first turn").model("gpt-4o"))
            .await
            .unwrap();
        drain(&mut handle).await;
        let session_id = handle.session_id().clone();

        // Reload the same model with a second script.
        let second = ScriptedModel::new("gpt-4o", vec![Ok(ChatDelta::text("two"))]);
        registry.register("test", move |requested: &str| {
            (requested == "gpt-4o").then(|| second.clone() as ModelHandle)
        });

        let mut handle = engine
            .send_message(
                &owner,
                SendMessageRequest::new("second turn").session(session_id.clone()),
            )
            .await
            .unwrap();
        drain(&mut handle).await;
        assert_eq!(handle.session_id(), &session_id);

        let messages = store.list_messages(&session_id).await.unwrap();
        assert_eq!(messages.len(), 4);
        assert!(messages.iter().all(|m| m.status == MessageStatus::Completed));
        assert_eq!(messages[3].text, "two");

        // Title still comes from the first turn.
        let session = store.load_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.title.as_deref(), Some("first turn"));
    }

    #[tokio::test]
    async fn new_session_falls_back_to_configured_default_model() {
        let model = ScriptedModel::new("default-model", vec![Ok(ChatDelta::text("ok"))]);
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ModelRegistry::new());
        registry.register("test", move |requested: &str| {
            (requested == "default-model").then(|| model.clone() as ModelHandle)
        });
        let engine = ChatStreamEngine::new(
            store.clone(),
            registry,
            EngineConfig {
                default_model_id: Some("default-model".to_string()),
            },
        );
        let owner = UserId::new();

        let mut handle = engine
            .send_message(&owner, SendMessageRequest::new("hi"))
            .await
            .unwrap();
        drain(&mut handle).await;

        let session = store
            .load_session(handle.session_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.model_id, "default-model");
    }

    #[tokio::test]
    async fn no_model_anywhere_is_invalid_input() {
        let engine = ChatStreamEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ModelRegistry::new()),
            EngineConfig::default(),
        );
        let err = engine
            .send_message(&UserId::new(), SendMessageRequest::new("hi"))
            .await
            .unwrap_err();
        assert_eq!(classify(&err).category, ErrorCategory::InvalidInput);
    }

    #[tokio::test]
    async fn delete_session_hides_it_from_listing() {
        let model = ScriptedModel::new("gpt-4o", vec![Ok(ChatDelta::text("ok"))]);
        let (engine, _store) = engine_with(model);
        let owner = UserId::new();

        let mut handle = engine
            .send_message(&owner, SendMessageRequest::new("hi").model("gpt-4o"))
            .await
            .unwrap();
        drain(&mut handle).await;

        assert_eq!(engine.list_sessions(&owner).await.unwrap().len(), 1);
        engine
            .delete_session(&owner, handle.session_id())
            .await
            .unwrap();
        assert!(engine.list_sessions(&owner).await.unwrap().is_empty());

        // Deleting for a stranger fails.
        let err = engine
            .delete_session(&UserId::new(), handle.session_id())
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<LlmError>().is_some());
    }
}
