//! chatgate core library.
//! Task routing, evidence retrieval, provider adapters, the canonical event
//! stream and chat history.

pub mod classifier;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod evidence;
pub mod history;
pub mod providers;
pub mod stream;
pub mod types;

pub use classifier::{classify, detect};
pub use config::GatewayConfig;
pub use coordinator::{validate, ChatReply, Coordinator};
pub use error::{GatewayError, PersistenceError, ProviderError, RetrievalError};
pub use evidence::{EvidenceRetriever, HttpLocalSearch, LocalSearch, TavilySearch, WebSearch};
pub use history::{HistoryStore, SessionRecord, SledHistoryStore, StoredMessage};
pub use providers::{
    CompletionProvider, DataAnalysisProvider, GeneralProvider, ProgressSink, ProgressUpdate,
    ProviderChunk, ProviderId, ProviderSet, ProviderStream, ResearchProvider,
};
pub use stream::CanonicalStreamEvent;
pub use types::{
    ChatMessage, ConversationRequest, EvidenceItem, EvidenceOrigin, GenerationOptions, Role,
    TaskType,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
