use crate::cancellation::CancellationController;
use crate::constants::{
    DEFAULT_ERROR_HEADER, DEFAULT_MAX_TOOL_ROUNDS, SESSION_TITLE_MAX_CHARS, TOOL_RESULT_PREFIX,
};
use crate::conversation::{reduce, Conversation, ConversationAction};
use crate::dispatch::ToolCallDispatcher;
use crate::generation_info::GenerationInfoFetcher;
use crate::projections::{
    ChatRequest, Endpoints, ProviderAdapter, ProviderKind, ProviderRegistry, SamplingConfig,
};
use crate::session::SessionStore;
use crate::streaming::{StreamHandler, StreamOutcome};
use crate::tool_schema::{available_tools, ChatMode};
use crate::types::*;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything one chat panel needs to talk to a model.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub model: String,
    /// Overrides routing by model name.
    pub provider: Option<ProviderKind>,
    pub openrouter_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub scope: SessionScope,
    pub system_prompt: Option<String>,
    pub sampling: SamplingConfig,
    pub stream: bool,
    pub mode: ChatMode,
    pub editing_group: Option<String>,
    pub error_header: String,
    pub max_tool_rounds: u32,
    pub endpoints: Endpoints,
}

impl EngineConfig {
    pub fn new(model: impl Into<String>, scope: SessionScope) -> Self {
        Self {
            model: model.into(),
            provider: None,
            openrouter_api_key: None,
            google_api_key: None,
            scope,
            system_prompt: None,
            sampling: SamplingConfig::default(),
            stream: true,
            mode: ChatMode::default(),
            editing_group: None,
            error_header: DEFAULT_ERROR_HEADER.to_string(),
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            endpoints: Endpoints::default(),
        }
    }

    pub fn provider_kind(&self) -> ProviderKind {
        self.provider
            .unwrap_or_else(|| ProviderKind::from_model_name(&self.model))
    }

    pub fn api_key(&self, kind: ProviderKind) -> Option<&str> {
        let key = match kind {
            ProviderKind::OpenRouter => self.openrouter_api_key.as_deref(),
            ProviderKind::Google => self.google_api_key.as_deref(),
        };
        key.filter(|k| !k.trim().is_empty())
    }
}

/// State changes a host can render.
#[derive(Debug, Clone, PartialEq)]
pub enum PanelEvent {
    MessagesChanged(Arc<Vec<Message>>),
    LoadingChanged(bool),
    SessionChanged(Option<SessionHeader>),
    ToolDispatched { name: String, succeeded: bool },
}

#[derive(Default)]
struct PanelState {
    conversation: Conversation,
    /// Id, title and creation time of the active session. Its `messages`
    /// field is not maintained; the conversation is the source of truth.
    session: Option<Session>,
    loading: bool,
    controller: CancellationController,
}

enum RequestOutcome {
    Finished,
    ToolCalls(Vec<ToolCall>),
    Cancelled,
    Failed,
}

pub struct ChatEngine {
    config: EngineConfig,
    client: reqwest::Client,
    registry: ProviderRegistry,
    store: Arc<dyn SessionStore>,
    dispatcher: Arc<dyn ToolCallDispatcher>,
    fetcher: GenerationInfoFetcher,
    state: Mutex<PanelState>,
    persist: tokio::sync::Mutex<()>,
    events: broadcast::Sender<PanelEvent>,
}

impl ChatEngine {
    pub fn new(
        config: EngineConfig,
        client: reqwest::Client,
        store: Arc<dyn SessionStore>,
        dispatcher: Arc<dyn ToolCallDispatcher>,
    ) -> Self {
        let fetcher = GenerationInfoFetcher::new(client.clone(), config.endpoints.openrouter.clone());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            client,
            registry: ProviderRegistry::default(),
            store,
            dispatcher,
            fetcher,
            state: Mutex::new(PanelState::default()),
            persist: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn with_registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_fetcher(mut self, fetcher: GenerationInfoFetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // --- Read side ---

    pub fn snapshot(&self) -> Arc<Vec<Message>> {
        self.lock().conversation.snapshot()
    }

    pub fn is_loading(&self) -> bool {
        self.lock().loading
    }

    pub fn active_session(&self) -> Option<SessionHeader> {
        self.lock().session.as_ref().map(Session::header)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PanelEvent> {
        self.events.subscribe()
    }

    // --- Chat operations ---

    /// Appends a user turn to the active session (creating one if needed) and
    /// fetches the reply. A response still in flight is aborted first.
    pub async fn send_chat_message(
        &self,
        prompt: &str,
        attachments: Vec<AttachedItem>,
        hidden_content: Option<String>,
    ) -> Result<()> {
        self.abort_pending();
        self.set_loading(true);

        let has_session = self.lock().session.is_some();
        if !has_session {
            let title: String = prompt.chars().take(SESSION_TITLE_MAX_CHARS).collect();
            let session = match self.store.create(&self.config.scope, &title).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("Failed to create chat session: {}", e);
                    self.set_loading(false);
                    return Err(e);
                }
            };
            let header = session.header();
            self.lock().session = Some(session);
            self.emit(PanelEvent::SessionChanged(Some(header)));
        }

        let mut message = Message::user(prompt);
        message.hidden_content = hidden_content.filter(|h| !h.is_empty());
        message.attached_files = (!attachments.is_empty()).then_some(attachments);
        self.apply(ConversationAction::AppendUser(message));

        if let Err(e) = self.save_active().await {
            tracing::error!("Failed to save session before request: {}", e);
        }

        self.fetch_response().await
    }

    /// Runs request rounds until the model stops asking for tools.
    pub async fn fetch_response(&self) -> Result<()> {
        let (mut epoch, mut token, snapshot) = {
            let mut st = self.lock();
            if st.controller.abort() {
                st.conversation = reduce(
                    std::mem::take(&mut st.conversation),
                    &ConversationAction::CloseTurn,
                );
            }
            st.loading = true;
            let (epoch, token) = st.controller.begin();
            (epoch, token, st.conversation.snapshot())
        };
        self.emit(PanelEvent::MessagesChanged(snapshot));
        self.emit(PanelEvent::LoadingChanged(true));

        let mut rounds = 0u32;
        loop {
            let outcome = self.run_request(&token).await;
            let calls = match outcome {
                RequestOutcome::ToolCalls(calls) => calls,
                RequestOutcome::Cancelled => {
                    tracing::info!("Request aborted (epoch {})", epoch);
                    return Ok(());
                }
                RequestOutcome::Finished | RequestOutcome::Failed => break,
            };

            if rounds >= self.config.max_tool_rounds {
                tracing::warn!(
                    "Stopping after {} tool rounds; model still requested: {}",
                    rounds,
                    calls
                        .iter()
                        .map(|c| c.function.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                break;
            }
            rounds += 1;

            self.run_tools(&token, &calls).await;
            if token.is_cancelled() {
                return Ok(());
            }
            if let Err(e) = self.save_active().await {
                tracing::error!("Failed to save session after tool round: {}", e);
            }

            let renewed = self.lock().controller.renew(epoch);
            match renewed {
                Some((next_epoch, next_token)) => {
                    epoch = next_epoch;
                    token = next_token;
                }
                None => return Ok(()),
            }
        }

        self.finish_request(epoch).await;
        Ok(())
    }

    /// Aborts the in-flight response. The partial answer stays as it is.
    pub async fn stop_response(&self) -> Result<()> {
        let aborted = self.abort_pending();
        let saved = if aborted { self.save_active().await } else { Ok(()) };
        self.set_loading(false);
        saved
    }

    /// Drops everything after the last visible user message before
    /// `from_index` and asks again.
    pub async fn regenerate_response(&self, from_index: usize) -> Result<()> {
        self.abort_pending();
        self.require_session()?;

        let cut = {
            let st = self.lock();
            let messages = st.conversation.messages();
            let end = from_index.min(messages.len());
            messages[..end]
                .iter()
                .rposition(|m| m.role == Role::User && !m.hidden)
        };
        let Some(cut) = cut else {
            tracing::warn!("No visible user message before index {} to regenerate from", from_index);
            self.set_loading(false);
            return Ok(());
        };

        self.apply(ConversationAction::Truncate(cut + 1));
        self.set_loading(true);
        self.save_active().await?;
        self.fetch_response().await
    }

    /// Replaces the user message at `from_index` (and everything after it)
    /// with `prompt`, keeping the original attachments.
    pub async fn edit_and_resubmit(&self, prompt: &str, from_index: usize) -> Result<()> {
        self.abort_pending();
        self.require_session()?;

        let original = self.lock().conversation.messages().get(from_index).cloned();
        let mut message = Message::user(prompt);
        if let Some(original) = original.filter(|m| m.role == Role::User) {
            message.hidden_content = original.hidden_content;
            message.attached_files = original.attached_files;
        }

        self.apply(ConversationAction::Truncate(from_index));
        self.apply(ConversationAction::AppendUser(message));
        self.set_loading(true);
        self.save_active().await?;
        self.fetch_response().await
    }

    // --- Session operations ---

    /// Leaves the current session; the next message starts a new one.
    pub async fn new_session(&self) -> Result<()> {
        self.abort_and_save().await;
        {
            let mut st = self.lock();
            st.session = None;
            st.conversation = Conversation::default();
            st.loading = false;
        }
        self.emit(PanelEvent::SessionChanged(None));
        self.emit(PanelEvent::MessagesChanged(Arc::new(Vec::new())));
        self.emit(PanelEvent::LoadingChanged(false));
        Ok(())
    }

    pub async fn load_session(&self, id: &str) -> Result<()> {
        self.abort_and_save().await;
        let mut session = self.store.load(&self.config.scope, id).await?;
        let messages = std::mem::take(&mut session.messages);
        let header = session.header();
        let snapshot = {
            let mut st = self.lock();
            st.session = Some(session);
            st.conversation = reduce(
                std::mem::take(&mut st.conversation),
                &ConversationAction::Replace(messages),
            );
            st.loading = false;
            st.conversation.snapshot()
        };
        tracing::info!("Loaded session {} ({} messages)", header.id, snapshot.len());
        self.emit(PanelEvent::SessionChanged(Some(header)));
        self.emit(PanelEvent::MessagesChanged(snapshot));
        self.emit(PanelEvent::LoadingChanged(false));
        Ok(())
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionHeader>> {
        self.store.list(&self.config.scope).await
    }

    pub async fn delete_session(&self, id: &str) -> Result<()> {
        let is_active = self.lock().session.as_ref().is_some_and(|s| s.id == id);
        if is_active {
            self.abort_pending();
        }
        let _persist = self.persist.lock().await;
        self.store.delete(&self.config.scope, id).await?;
        if is_active {
            self.clear_active();
        }
        Ok(())
    }

    pub async fn rename_session(&self, id: &str, title: &str) -> Result<()> {
        self.store.rename(&self.config.scope, id, title).await?;
        let header = {
            let mut st = self.lock();
            match st.session.as_mut() {
                Some(s) if s.id == id => {
                    s.title = title.to_string();
                    Some(s.header())
                }
                _ => None,
            }
        };
        if let Some(header) = header {
            self.emit(PanelEvent::SessionChanged(Some(header)));
        }
        Ok(())
    }

    pub async fn delete_all_sessions(&self) -> Result<()> {
        self.abort_pending();
        let _persist = self.persist.lock().await;
        self.store.delete_all(&self.config.scope).await?;
        self.clear_active();
        Ok(())
    }

    // --- Request plumbing ---

    async fn run_request(&self, token: &CancellationToken) -> RequestOutcome {
        let kind = self.config.provider_kind();
        let Some(adapter) = self.registry.get(kind) else {
            return self.fail(token, format!("No adapter registered for provider {}", kind));
        };
        let Some(api_key) = self.config.api_key(kind) else {
            let err = ColloquyError::MissingApiKey(kind.to_string());
            tracing::error!("{}", err);
            return self.fail(token, err.to_string());
        };

        let messages = self.snapshot();
        let tools = available_tools(self.config.mode, self.config.editing_group.as_deref());
        let request = ChatRequest {
            model: &self.config.model,
            messages: messages.as_slice(),
            system_prompt: self.config.system_prompt.as_deref(),
            sampling: &self.config.sampling,
            tools: &tools,
            stream: self.config.stream,
        };
        let payload = match adapter.build_payload(&request) {
            Ok(p) => p,
            Err(e) => return self.fail(token, e.to_string()),
        };

        let url = adapter.endpoint(&self.config.endpoints, &self.config.model, self.config.stream);
        tracing::info!(
            "[⚙️  -> ☁️ ] {} request to {} ({} messages, {} tools, stream={})",
            kind,
            self.config.model,
            messages.len(),
            tools.len(),
            self.config.stream
        );

        let builder = adapter.authorize(self.client.post(&url).json(&payload), api_key);
        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return RequestOutcome::Cancelled,
            r = builder.send() => r,
        };
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("[☁️  -> ⚙️ ] Transport error: {}", e);
                return self.fail(token, e.to_string());
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = tokio::select! {
                biased;
                _ = token.cancelled() => return RequestOutcome::Cancelled,
                b = response.text() => b.unwrap_or_default(),
            };
            let message = adapter.parse_error(status, &body);
            tracing::error!("[☁️  -> ⚙️ ] {} returned {}: {}", kind, status, message);
            return self.fail(token, message);
        }

        if self.config.stream {
            self.consume_stream(adapter.as_ref(), api_key, response, token).await
        } else {
            self.consume_single(adapter.as_ref(), api_key, response, token).await
        }
    }

    async fn consume_stream(
        &self,
        adapter: &dyn ProviderAdapter,
        api_key: &str,
        response: reqwest::Response,
        token: &CancellationToken,
    ) -> RequestOutcome {
        let mut decoder = adapter.stream_decoder();
        let summary = StreamHandler::drive(response.bytes_stream(), decoder.as_mut(), token, |delta| {
            self.apply_if_current(token, ConversationAction::Delta(delta))
        })
        .await;

        match summary.outcome {
            StreamOutcome::Cancelled => return RequestOutcome::Cancelled,
            StreamOutcome::Failed(message) => return self.fail(token, message),
            StreamOutcome::Completed | StreamOutcome::HaltedOnToolCall => {}
        }

        self.apply_if_current(token, ConversationAction::CloseTurn);
        if let Some(usage) = summary.final_usage {
            self.apply_if_current(token, ConversationAction::AttachGenerationInfo(usage));
        }
        if let Some(id) = summary.generation_id.as_deref() {
            if let Some(info) = self.lookup_generation(id, api_key, token).await {
                self.apply_if_current(token, ConversationAction::AttachGenerationInfo(info));
            }
        }

        if token.is_cancelled() {
            RequestOutcome::Cancelled
        } else if summary.tool_calls.is_empty() {
            RequestOutcome::Finished
        } else {
            RequestOutcome::ToolCalls(summary.tool_calls)
        }
    }

    async fn consume_single(
        &self,
        adapter: &dyn ProviderAdapter,
        api_key: &str,
        response: reqwest::Response,
        token: &CancellationToken,
    ) -> RequestOutcome {
        let body = tokio::select! {
            biased;
            _ = token.cancelled() => return RequestOutcome::Cancelled,
            b = response.bytes() => b,
        };
        let body = match body {
            Ok(b) => b,
            Err(e) => return self.fail(token, format!("Failed to read response: {}", e)),
        };
        let decoded = match adapter.decode_response(&body) {
            Ok(d) => d,
            Err(e) => return self.fail(token, e.to_string()),
        };

        let mut message = decoded.message;
        if let Some(id) = decoded.generation_id.as_deref() {
            if let Some(info) = self.lookup_generation(id, api_key, token).await {
                message.generation_info = Some(info);
            }
        }

        let tool_calls = message.tool_calls.clone().unwrap_or_default();
        if !self.apply_if_current(token, ConversationAction::AppendAssistant(message)) {
            return RequestOutcome::Cancelled;
        }
        if tool_calls.is_empty() {
            RequestOutcome::Finished
        } else {
            RequestOutcome::ToolCalls(tool_calls)
        }
    }

    async fn lookup_generation(
        &self,
        id: &str,
        api_key: &str,
        token: &CancellationToken,
    ) -> Option<GenerationInfo> {
        tokio::select! {
            biased;
            _ = token.cancelled() => None,
            info = self.fetcher.fetch(id, api_key) => info,
        }
    }

    async fn run_tools(&self, token: &CancellationToken, calls: &[ToolCall]) {
        for call in calls {
            if token.is_cancelled() {
                return;
            }
            let outcome = self.dispatcher.dispatch(call).await;
            let status = if outcome.succeeded {
                ToolCallStatus::Success
            } else {
                ToolCallStatus::Error
            };
            tracing::info!(
                "[🔧 -> ⚙️ ] {} finished: {:?} ({} chars)",
                call.function.name,
                status,
                outcome.content.len()
            );

            self.apply_if_current(
                token,
                ConversationAction::SetToolStatus {
                    tool_call_id: call.id.clone(),
                    status,
                    diff_stats: outcome.diff_stats,
                },
            );
            self.apply_if_current(
                token,
                ConversationAction::AppendUser(Message::hidden_user(format!(
                    "{} {}]\n{}",
                    TOOL_RESULT_PREFIX, call.function.name, outcome.content
                ))),
            );
            self.emit(PanelEvent::ToolDispatched {
                name: call.function.name.clone(),
                succeeded: outcome.succeeded,
            });
        }
    }

    /// Appends a synthetic error message for this turn.
    fn fail(&self, token: &CancellationToken, message: String) -> RequestOutcome {
        let appended = self.apply_if_current(
            token,
            ConversationAction::AppendError {
                header: self.config.error_header.clone(),
                message,
            },
        );
        if appended {
            RequestOutcome::Failed
        } else {
            RequestOutcome::Cancelled
        }
    }

    /// Save, then release the loading flag, but only if no other operation
    /// has taken over the panel in the meantime.
    async fn finish_request(&self, epoch: u64) {
        let owned = self.lock().controller.current_epoch() == Some(epoch);
        if !owned {
            return;
        }
        self.apply(ConversationAction::CloseTurn);
        if let Err(e) = self.save_active().await {
            tracing::error!("Failed to save session after request: {}", e);
        }
        let released = {
            let mut st = self.lock();
            let released = st.controller.finish(epoch);
            if released {
                st.loading = false;
            }
            released
        };
        if released {
            self.emit(PanelEvent::LoadingChanged(false));
        }
    }

    // --- State helpers ---

    fn lock(&self) -> MutexGuard<'_, PanelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PanelEvent) {
        let _ = self.events.send(event);
    }

    fn apply(&self, action: ConversationAction) {
        let snapshot = {
            let mut st = self.lock();
            st.conversation = reduce(std::mem::take(&mut st.conversation), &action);
            st.conversation.snapshot()
        };
        self.emit(PanelEvent::MessagesChanged(snapshot));
    }

    /// Applies `action` unless `token` was cancelled. The check happens under
    /// the same lock as the mutation.
    fn apply_if_current(&self, token: &CancellationToken, action: ConversationAction) -> bool {
        let snapshot = {
            let mut st = self.lock();
            if token.is_cancelled() {
                return false;
            }
            st.conversation = reduce(std::mem::take(&mut st.conversation), &action);
            st.conversation.snapshot()
        };
        self.emit(PanelEvent::MessagesChanged(snapshot));
        true
    }

    fn set_loading(&self, loading: bool) {
        self.lock().loading = loading;
        self.emit(PanelEvent::LoadingChanged(loading));
    }

    /// Cancels the live request, if any, and closes its turn.
    fn abort_pending(&self) -> bool {
        let mut st = self.lock();
        let aborted = st.controller.abort();
        if aborted {
            st.conversation = reduce(
                std::mem::take(&mut st.conversation),
                &ConversationAction::CloseTurn,
            );
        }
        aborted
    }

    async fn abort_and_save(&self) {
        self.abort_pending();
        if let Err(e) = self.save_active().await {
            tracing::error!("Failed to save session before switching: {}", e);
        }
    }

    fn require_session(&self) -> Result<()> {
        if self.lock().session.is_some() {
            Ok(())
        } else {
            Err(ColloquyError::NoActiveSession.into())
        }
    }

    fn clear_active(&self) {
        {
            let mut st = self.lock();
            st.session = None;
            st.conversation = Conversation::default();
            st.loading = false;
        }
        self.emit(PanelEvent::SessionChanged(None));
        self.emit(PanelEvent::MessagesChanged(Arc::new(Vec::new())));
        self.emit(PanelEvent::LoadingChanged(false));
    }

    /// Writes the active session. Saves and deletes are serialized, and the
    /// snapshot is taken once the write slot is held, so a save queued behind
    /// a delete of the same session finds it gone instead of recreating it.
    async fn save_active(&self) -> Result<()> {
        let _persist = self.persist.lock().await;
        let session = {
            let st = self.lock();
            st.session.as_ref().map(|s| Session {
                messages: st.conversation.messages().to_vec(),
                ..s.clone()
            })
        };
        match session {
            Some(session) => self.store.save(&self.config.scope, &session).await,
            None => Ok(()),
        }
    }
}
