//! The canonical client event and the translation from provider chunks.

pub mod pseudo;

pub use pseudo::{pseudo_stream, rechunk};

use crate::providers::{ProgressUpdate, ProviderChunk};
use crate::types::EvidenceItem;
use serde::{Deserialize, Serialize};

/// One frame of the client stream. Serialized with a `type` tag, e.g.
/// `{"type":"chunk","content":"..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CanonicalStreamEvent {
    Start {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Evidence {
        items: Vec<EvidenceItem>,
    },
    Progress {
        #[serde(rename = "content")]
        stage: String,
        #[serde(rename = "output")]
        message: String,
    },
    #[serde(rename = "chunk")]
    Delta {
        #[serde(rename = "content")]
        text: String,
    },
    Done {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Error {
        message: String,
    },
}

impl CanonicalStreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CanonicalStreamEvent::Done { .. } | CanonicalStreamEvent::Error { .. })
    }

    /// Wire name of the frame type.
    pub fn kind(&self) -> &'static str {
        match self {
            CanonicalStreamEvent::Start { .. } => "start",
            CanonicalStreamEvent::Evidence { .. } => "evidence",
            CanonicalStreamEvent::Progress { .. } => "progress",
            CanonicalStreamEvent::Delta { .. } => "chunk",
            CanonicalStreamEvent::Done { .. } => "done",
            CanonicalStreamEvent::Error { .. } => "error",
        }
    }
}

impl From<ProgressUpdate> for CanonicalStreamEvent {
    fn from(update: ProgressUpdate) -> Self {
        CanonicalStreamEvent::Progress { stage: update.stage, message: update.message }
    }
}

/// Provider chunk to client event. Flushes and empty deltas produce nothing.
pub fn normalize(chunk: ProviderChunk) -> Option<CanonicalStreamEvent> {
    match chunk {
        ProviderChunk::Delta(text) if !text.is_empty() => Some(CanonicalStreamEvent::Delta { text }),
        ProviderChunk::Delta(_) | ProviderChunk::Flush => None,
    }
}

/// Compact JSON for one event.
pub fn encode_frame(event: &CanonicalStreamEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|_| {
        r#"{"type":"error","message":"failed to encode stream event"}"#.to_string()
    })
}

/// A complete SSE record: one `data:` line plus the blank separator.
pub fn sse_record(event: &CanonicalStreamEvent) -> String {
    format!("data: {}\n\n", encode_frame(event))
}
