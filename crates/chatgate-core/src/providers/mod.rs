//! Completion providers behind one contract: a blocking `complete` and a
//! chunked `complete_stream`.

pub mod bridge;
pub mod data;
pub mod general;
pub mod research;
pub mod wire;

pub use data::DataAnalysisProvider;
pub use general::GeneralProvider;
pub use research::ResearchProvider;

use crate::error::ProviderError;
use crate::types::{ChatMessage, GenerationOptions, TaskType};
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Unit of provider output. `Flush` carries no text; it only lets the
/// transport push pending progress to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderChunk {
    Delta(String),
    Flush,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub stage: String,
    pub message: String,
}

impl ProgressUpdate {
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self { stage: stage.into(), message: message.into() }
    }
}

/// Write side of a per-request progress queue. The coordinator drains the
/// receiving side after each provider chunk.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ProgressSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Dropped silently once the request is gone.
    pub fn emit(&self, update: ProgressUpdate) {
        let _ = self.tx.send(update);
    }
}

pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<ProviderChunk, ProviderError>> + Send>>;

/// Box an adapter stream, pinning its error type to `ProviderError`.
pub(crate) fn boxed_stream<S>(stream: S) -> ProviderStream
where
    S: Stream<Item = Result<ProviderChunk, ProviderError>> + Send + 'static,
{
    Box::pin(stream)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderId {
    General,
    Research,
    DataAnalysis,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::General => "general",
            ProviderId::Research => "research",
            ProviderId::DataAnalysis => "data-analysis",
        }
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<String, ProviderError>;

    fn complete_stream(
        &self,
        messages: Vec<ChatMessage>,
        options: GenerationOptions,
        progress: Option<ProgressSink>,
    ) -> ProviderStream;
}

/// The three adapters, constructed once at startup.
#[derive(Clone)]
pub struct ProviderSet {
    pub general: Arc<dyn CompletionProvider>,
    pub research: Arc<dyn CompletionProvider>,
    pub data: Arc<dyn CompletionProvider>,
}

impl ProviderSet {
    pub fn select(&self, task: TaskType) -> Arc<dyn CompletionProvider> {
        match task {
            TaskType::Research => Arc::clone(&self.research),
            TaskType::Data => Arc::clone(&self.data),
            TaskType::General | TaskType::Auto => Arc::clone(&self.general),
        }
    }
}

/// Last user message, else the last message of any role.
pub(crate) fn task_text(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == crate::types::Role::User)
        .or_else(|| messages.last())
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_text_prefers_last_user_turn() {
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("first"),
            ChatMessage::user("second"),
            ChatMessage::assistant("reply"),
        ];
        assert_eq!(task_text(&messages), "second");
        assert_eq!(task_text(&[ChatMessage::system("only")]), "only");
        assert_eq!(task_text(&[]), "");
    }

    #[tokio::test]
    async fn progress_sink_delivers_in_order() {
        let (sink, mut rx) = ProgressSink::channel();
        sink.emit(ProgressUpdate::new("a", "1"));
        sink.emit(ProgressUpdate::new("b", "2"));
        assert_eq!(rx.recv().await.unwrap().stage, "a");
        assert_eq!(rx.recv().await.unwrap().stage, "b");
    }
}
