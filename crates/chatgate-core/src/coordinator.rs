//! One conversation turn, end to end: classify, gather evidence, call the
//! selected provider and persist both sides of the exchange.

use crate::classifier::classify;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, ProviderError};
use crate::evidence::{assemble_messages, sources_payload, EvidenceRetriever, SourcesPayload};
use crate::history::HistoryStore;
use crate::providers::{CompletionProvider, ProgressSink, ProviderId, ProviderSet};
use crate::stream::{normalize, CanonicalStreamEvent};
use crate::types::{ChatMessage, ConversationRequest, EvidenceItem, GenerationOptions, Role, TaskType};
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Reply of the blocking chat call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub session_id: String,
    pub content: String,
    pub evidence: Vec<EvidenceItem>,
    pub sources: SourcesPayload,
    pub history: Vec<ChatMessage>,
}

/// Everything decided before the provider is called.
struct PreparedTurn {
    task: TaskType,
    provider: Arc<dyn CompletionProvider>,
    messages: Vec<ChatMessage>,
    options: GenerationOptions,
    evidence: Vec<EvidenceItem>,
}

/// Bookkeeping for one streamed provider call. Logs when the client goes
/// away before the terminal frame.
struct ProviderSession {
    provider: ProviderId,
    session_id: String,
    buffer: String,
    started: Instant,
    completed: bool,
}

impl ProviderSession {
    fn new(provider: ProviderId, session_id: &str) -> Self {
        Self {
            provider,
            session_id: session_id.to_string(),
            buffer: String::new(),
            started: Instant::now(),
            completed: false,
        }
    }
}

impl Drop for ProviderSession {
    fn drop(&mut self) {
        if !self.completed {
            tracing::info!(
                target: "chatgate::coordinator",
                session_id = %self.session_id,
                provider = %self.provider,
                delivered_chars = self.buffer.chars().count(),
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "stream abandoned before completion"
            );
        }
    }
}

/// Rejects requests that must never reach a provider.
pub fn validate(req: &ConversationRequest) -> Result<(), GatewayError> {
    if req.user_message.trim().is_empty() {
        return Err(GatewayError::Validation("message must not be empty".into()));
    }
    Ok(())
}

pub struct Coordinator {
    config: GatewayConfig,
    retriever: EvidenceRetriever,
    providers: ProviderSet,
    history: Arc<dyn HistoryStore>,
}

impl Coordinator {
    pub fn new(
        config: GatewayConfig,
        retriever: EvidenceRetriever,
        providers: ProviderSet,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        Self { config, retriever, providers, history }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    fn placeholder(&self) -> &str {
        &self.config.prompts.placeholder_reply
    }

    async fn prepare(&self, req: &ConversationRequest) -> PreparedTurn {
        let task = classify(&req.user_message, req.task_type, &self.config.routing);
        let retrieval = self
            .retriever
            .retrieve(&req.user_message, req.use_local_search, req.use_web_search)
            .await;
        let evidence = retrieval.merged();
        let system_prompt = self.config.build_system_prompt(&req.temporary_prompts);
        let messages = assemble_messages(&system_prompt, &req.history, &req.user_message, &evidence);
        let options = req.options.clone().merged_over(&self.config.prompts.default_options);
        let provider = self.providers.select(task);
        tracing::info!(
            target: "chatgate::coordinator",
            session_id = %req.session_id,
            task = task.as_str(),
            provider = %provider.id(),
            evidence = evidence.len(),
            "turn routed"
        );
        PreparedTurn { task, provider, messages, options, evidence }
    }

    async fn record_user_turn(&self, req: &ConversationRequest) {
        if let Err(e) = self.history.upsert_session(&req.session_id, None).await {
            tracing::warn!(target: "chatgate::coordinator", session_id = %req.session_id, error = %e, "session upsert failed");
        }
        if let Err(e) = self
            .history
            .insert_message(&req.session_id, Role::User, &req.user_message)
            .await
        {
            tracing::warn!(target: "chatgate::coordinator", session_id = %req.session_id, error = %e, "saving user message failed");
        }
    }

    async fn record_assistant_turn(&self, session_id: &str, content: &str) {
        if let Err(e) = self
            .history
            .insert_message(session_id, Role::Assistant, content)
            .await
        {
            tracing::warn!(target: "chatgate::coordinator", session_id, error = %e, "saving assistant message failed");
        }
        if let Err(e) = self.history.upsert_session(session_id, None).await {
            tracing::warn!(target: "chatgate::coordinator", session_id, error = %e, "session touch failed");
        }
    }

    /// Blocking turn. Provider failures are returned to the caller; history
    /// failures are only logged.
    pub async fn chat(&self, req: ConversationRequest) -> Result<ChatReply, GatewayError> {
        validate(&req)?;
        let turn = self.prepare(&req).await;
        self.record_user_turn(&req).await;

        let started = Instant::now();
        let content = turn.provider.complete(&turn.messages, &turn.options).await?;
        let content = if content.trim().is_empty() {
            tracing::warn!(target: "chatgate::coordinator", session_id = %req.session_id, provider = %turn.provider.id(), "provider returned no content");
            self.placeholder().to_string()
        } else {
            content
        };
        self.record_assistant_turn(&req.session_id, &content).await;
        tracing::info!(
            target: "chatgate::coordinator",
            session_id = %req.session_id,
            task = turn.task.as_str(),
            chars = content.chars().count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "turn completed"
        );

        let mut history = req.history;
        history.push(ChatMessage::user(req.user_message));
        history.push(ChatMessage::assistant(content.clone()));
        Ok(ChatReply {
            session_id: req.session_id,
            content,
            sources: sources_payload(&turn.evidence),
            evidence: turn.evidence,
            history,
        })
    }

    /// Streamed turn. Always yields `start` first and exactly one terminal
    /// frame (`done` or `error`) last.
    pub fn chat_stream(
        self: Arc<Self>,
        req: ConversationRequest,
    ) -> impl Stream<Item = CanonicalStreamEvent> + Send + 'static {
        let this = self;
        async_stream::stream! {
            let session_id = req.session_id.clone();
            yield CanonicalStreamEvent::Start { session_id: session_id.clone() };
            if let Err(e) = validate(&req) {
                yield CanonicalStreamEvent::Error { message: e.to_string() };
                return;
            }

            let turn = this.prepare(&req).await;
            yield CanonicalStreamEvent::Evidence { items: turn.evidence.clone() };
            this.record_user_turn(&req).await;

            let (sink, mut progress) = ProgressSink::channel();
            let mut session = ProviderSession::new(turn.provider.id(), &session_id);
            let mut chunks = turn.provider.complete_stream(turn.messages, turn.options, Some(sink));
            let mut failure: Option<ProviderError> = None;

            while let Some(item) = chunks.next().await {
                while let Ok(update) = progress.try_recv() {
                    yield CanonicalStreamEvent::from(update);
                }
                match item {
                    Ok(chunk) => {
                        if let Some(event) = normalize(chunk) {
                            if let CanonicalStreamEvent::Delta { text } = &event {
                                session.buffer.push_str(text);
                            }
                            yield event;
                        }
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            drop(chunks);
            while let Ok(update) = progress.try_recv() {
                yield CanonicalStreamEvent::from(update);
            }

            let elapsed_ms = session.started.elapsed().as_millis() as u64;
            let terminal = match failure {
                Some(e) => {
                    tracing::warn!(
                        target: "chatgate::coordinator",
                        session_id = %session_id,
                        provider = %session.provider,
                        error = %e,
                        elapsed_ms,
                        "provider stream failed"
                    );
                    this.record_assistant_turn(&session_id, this.placeholder()).await;
                    CanonicalStreamEvent::Error { message: e.to_string() }
                }
                None if session.buffer.trim().is_empty() => {
                    tracing::warn!(
                        target: "chatgate::coordinator",
                        session_id = %session_id,
                        provider = %session.provider,
                        elapsed_ms,
                        "provider stream produced no content"
                    );
                    this.record_assistant_turn(&session_id, this.placeholder()).await;
                    CanonicalStreamEvent::Error { message: this.placeholder().to_string() }
                }
                None => {
                    this.record_assistant_turn(&session_id, &session.buffer).await;
                    tracing::info!(
                        target: "chatgate::coordinator",
                        session_id = %session_id,
                        provider = %session.provider,
                        task = turn.task.as_str(),
                        chars = session.buffer.chars().count(),
                        elapsed_ms,
                        "stream completed"
                    );
                    CanonicalStreamEvent::Done { session_id: session_id.clone() }
                }
            };
            session.completed = true;
            yield terminal;
        }
    }
}
