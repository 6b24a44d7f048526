//! Request-scoped data model shared by every layer of the gateway.

use serde::{Deserialize, Serialize};

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One turn of a conversation, in the shape every OpenAI-style backend accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Requested (or resolved) task type. `Auto` only ever appears on requests;
/// the classifier always resolves it to one of the other three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    #[default]
    Auto,
    General,
    Research,
    Data,
}

impl TaskType {
    /// Lenient parse used for request bodies: `chat` is an alias of `general`,
    /// anything unrecognized means "let the classifier decide".
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "general" | "chat" => TaskType::General,
            "research" => TaskType::Research,
            "data" => TaskType::Data,
            _ => TaskType::Auto,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Auto => "auto",
            TaskType::General => "general",
            TaskType::Research => "research",
            TaskType::Data => "data",
        }
    }
}

/// Generation parameters forwarded to providers. Unknown keys are carried in
/// `extra` and passed through to OpenAI-compatible backends untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Research reports only: `research_report` or `detailed_report`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_type: Option<String>,
    /// Research reports only: free-form tone, normalized by the research adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl GenerationOptions {
    /// Request values win; anything the request leaves unset comes from `defaults`.
    pub fn merged_over(self, defaults: &GenerationOptions) -> GenerationOptions {
        let mut extra = defaults.extra.clone();
        extra.extend(self.extra);
        GenerationOptions {
            model: self.model.or_else(|| defaults.model.clone()),
            temperature: self.temperature.or(defaults.temperature),
            top_p: self.top_p.or(defaults.top_p),
            max_tokens: self.max_tokens.or(defaults.max_tokens),
            report_type: self.report_type.or_else(|| defaults.report_type.clone()),
            tone: self.tone.or_else(|| defaults.tone.clone()),
            extra,
        }
    }
}

/// A validated chat request, ready for the coordinator.
#[derive(Debug, Clone)]
pub struct ConversationRequest {
    pub session_id: String,
    pub user_message: String,
    pub history: Vec<ChatMessage>,
    pub task_type: TaskType,
    pub use_local_search: bool,
    pub use_web_search: bool,
    pub options: GenerationOptions,
    pub temporary_prompts: Vec<String>,
}

impl ConversationRequest {
    pub fn new(session_id: impl Into<String>, user_message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_message: user_message.into(),
            history: Vec::new(),
            task_type: TaskType::Auto,
            use_local_search: false,
            use_web_search: false,
            options: GenerationOptions::default(),
            temporary_prompts: Vec::new(),
        }
    }

    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_local_search(mut self, enabled: bool) -> Self {
        self.use_local_search = enabled;
        self
    }

    pub fn with_web_search(mut self, enabled: bool) -> Self {
        self.use_web_search = enabled;
        self
    }
}

/// Where a piece of evidence came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceOrigin {
    Local,
    Web,
}

/// One retrieved piece of evidence, as shown to the client and the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceItem {
    pub origin: EvidenceOrigin,
    pub title: String,
    pub summary: String,
    pub url: String,
    pub published_at: Option<String>,
    pub source: String,
    /// Similarity (local) or search score (web).
    pub relevance: Option<f64>,
}

impl EvidenceItem {
    /// Dedup key: url when present, else title.
    pub fn dedup_key(&self) -> &str {
        let url = self.url.trim();
        if url.is_empty() {
            self.title.trim()
        } else {
            url
        }
    }
}
