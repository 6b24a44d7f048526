//! Research report provider.
//!
//! Two transports against the same backend: a blocking `POST {base}/report/`
//! (with `POST {base}/api/chat` as a fallback) and a progressive WebSocket
//! session at `{base}/ws` that streams log frames before the final report.
//! The socket runs behind the bridge; whatever text comes back is re-chunked
//! so the client always sees a stream.

use super::bridge::{self, BridgeConfig, BridgeMessage, BridgeOutcome, BridgeStep, ProgressiveSocket};
use super::{
    boxed_stream, task_text, CompletionProvider, ProgressSink, ProgressUpdate, ProviderChunk, ProviderId,
    ProviderStream,
};
use crate::config::ResearchProviderConfig;
use crate::error::ProviderError;
use crate::stream::pseudo_stream;
use crate::types::{ChatMessage, GenerationOptions};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

const SOCKET_READ_TIMEOUT: Duration = Duration::from_secs(2);
const REFERENCES_HEADING: &str = "## References";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tone {
    Informative,
    Objective,
    Formal,
    Analytical,
    Persuasive,
    Explanatory,
    Descriptive,
    Critical,
    Comparative,
    Speculative,
    Reflective,
    Narrative,
    Humorous,
    Optimistic,
    Pessimistic,
    Simple,
    Casual,
}

/// Accepted spellings, matched after trimming and lowercasing.
const TONE_ALIASES: &[(&str, Tone)] = &[
    ("informative", Tone::Informative),
    ("objective", Tone::Objective),
    ("formal", Tone::Formal),
    ("analytical", Tone::Analytical),
    ("persuasive", Tone::Persuasive),
    ("explanatory", Tone::Explanatory),
    ("descriptive", Tone::Descriptive),
    ("critical", Tone::Critical),
    ("comparative", Tone::Comparative),
    ("speculative", Tone::Speculative),
    ("reflective", Tone::Reflective),
    ("narrative", Tone::Narrative),
    ("humorous", Tone::Humorous),
    ("optimistic", Tone::Optimistic),
    ("pessimistic", Tone::Pessimistic),
    ("simple", Tone::Simple),
    ("casual", Tone::Casual),
    ("信息性", Tone::Informative),
    ("客观", Tone::Objective),
    ("正式", Tone::Formal),
    ("分析性", Tone::Analytical),
    ("说服性", Tone::Persuasive),
    ("解释性", Tone::Explanatory),
    ("描述性", Tone::Descriptive),
    ("批判性", Tone::Critical),
    ("比较性", Tone::Comparative),
    ("推测性", Tone::Speculative),
    ("反思性", Tone::Reflective),
    ("叙述性", Tone::Narrative),
    ("幽默", Tone::Humorous),
    ("乐观", Tone::Optimistic),
    ("悲观", Tone::Pessimistic),
    ("简洁", Tone::Simple),
    ("随意", Tone::Casual),
];

impl Tone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tone::Informative => "Informative",
            Tone::Objective => "Objective",
            Tone::Formal => "Formal",
            Tone::Analytical => "Analytical",
            Tone::Persuasive => "Persuasive",
            Tone::Explanatory => "Explanatory",
            Tone::Descriptive => "Descriptive",
            Tone::Critical => "Critical",
            Tone::Comparative => "Comparative",
            Tone::Speculative => "Speculative",
            Tone::Reflective => "Reflective",
            Tone::Narrative => "Narrative",
            Tone::Humorous => "Humorous",
            Tone::Optimistic => "Optimistic",
            Tone::Pessimistic => "Pessimistic",
            Tone::Simple => "Simple",
            Tone::Casual => "Casual",
        }
    }

    pub fn lookup(raw: &str) -> Option<Tone> {
        let key = raw.trim().to_lowercase();
        TONE_ALIASES.iter().find(|(alias, _)| *alias == key).map(|(_, tone)| *tone)
    }
}

/// Free-form tone to the backend's enum. Unknown values become
/// `Informative` with one warning.
pub fn normalize_tone(raw: &str) -> Tone {
    if raw.trim().is_empty() {
        return Tone::Informative;
    }
    Tone::lookup(raw).unwrap_or_else(|| {
        tracing::warn!(target: "chatgate::provider", tone = raw, "unknown tone, using Informative");
        Tone::Informative
    })
}

#[derive(Debug, Serialize)]
struct ReportRequest<'a> {
    task: &'a str,
    report_type: &'a str,
    report_source: &'static str,
    tone: &'static str,
    headers: Option<Value>,
    repo_name: &'static str,
    branch_name: &'static str,
    generate_in_background: bool,
}

impl<'a> ReportRequest<'a> {
    fn new(task: &'a str, report_type: &'a str, tone: Tone) -> Self {
        Self {
            task,
            report_type,
            report_source: "web",
            tone: tone.as_str(),
            headers: None,
            repo_name: "",
            branch_name: "",
            generate_in_background: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ResearchInformation {
    #[serde(default)]
    source_urls: Vec<String>,
    #[serde(default)]
    visited_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ReportResponse {
    #[serde(default)]
    report: Option<String>,
    #[serde(default)]
    research_information: Option<ResearchInformation>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ChatFallbackRequest<'a> {
    report: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Debug, Deserialize)]
struct ChatFallbackResponse {
    #[serde(default)]
    response: Option<ChatFallbackMessage>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatFallbackMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    metadata: Option<Value>,
}

fn upstream_error(error: Option<Value>) -> Option<ProviderError> {
    match error {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(ProviderError::Upstream(s)),
        Some(other) => Some(ProviderError::Upstream(other.to_string())),
    }
}

fn has_references(report: &str) -> bool {
    report.contains("参考文献")
        || report.lines().any(|line| {
            let line = line.trim();
            line.starts_with('#') && line.trim_start_matches('#').trim().eq_ignore_ascii_case("references")
        })
}

fn append_reference_lines(report: &str, lines: &[String]) -> String {
    if lines.is_empty() || has_references(report) {
        return report.to_string();
    }
    format!("{}\n\n{REFERENCES_HEADING}\n\n{}", report.trim_end(), lines.join("\n"))
}

fn numbered_unique<'a>(urls: impl IntoIterator<Item = &'a String>) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.into_iter()
        .map(|u| u.trim())
        .filter(|u| !u.is_empty() && seen.insert(*u))
        .enumerate()
        .map(|(idx, url)| format!("[{}] {url}", idx + 1))
        .collect()
}

/// Append a numbered references section built from `source_urls` (or
/// `visited_urls` when that yields nothing), unless the report already has one.
pub fn append_references(report: &str, source_urls: &[String], visited_urls: &[String]) -> String {
    if has_references(report) {
        return report.to_string();
    }
    let mut lines = numbered_unique(source_urls);
    if lines.is_empty() {
        lines = numbered_unique(visited_urls);
    }
    append_reference_lines(report, &lines)
}

/// `[n] title. url` lines from the `quick_search` tool calls in chat metadata.
fn tool_call_references(metadata: &Value) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut lines = Vec::new();
    let calls = metadata.get("tool_calls").and_then(Value::as_array);
    for call in calls.into_iter().flatten() {
        if call.get("tool").and_then(Value::as_str) != Some("quick_search") {
            continue;
        }
        let sources = call.pointer("/search_metadata/sources").and_then(Value::as_array);
        for source in sources.into_iter().flatten() {
            let url = source.get("url").and_then(Value::as_str).unwrap_or_default().trim();
            if url.is_empty() || !seen.insert(url.to_string()) {
                continue;
            }
            let title = source.get("title").and_then(Value::as_str).unwrap_or_default().trim();
            let n = lines.len() + 1;
            lines.push(if title.is_empty() {
                format!("[{n}] {url}")
            } else {
                format!("[{n}] {title}. {url}")
            });
        }
    }
    lines
}

/// What one text frame from the research socket means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketFrame {
    Pong,
    Progress(ProgressUpdate),
    Report(String),
    /// Completion signal (`type: path`) with no report attached.
    Completed,
    Ignored,
}

fn value_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

pub fn classify_frame(text: &str) -> SocketFrame {
    if text == "pong" {
        return SocketFrame::Pong;
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(frame)) => {
            let kind = frame.get("type").and_then(Value::as_str);
            if kind == Some("logs") {
                return SocketFrame::Progress(ProgressUpdate::new(
                    value_text(frame.get("content")),
                    value_text(frame.get("output")),
                ));
            }
            if kind == Some("report") || frame.contains_key("report") {
                let report = frame
                    .get("report")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .or_else(|| frame.get("content").and_then(Value::as_str))
                    .unwrap_or_default();
                return if report.is_empty() {
                    SocketFrame::Ignored
                } else {
                    SocketFrame::Report(report.to_string())
                };
            }
            if kind == Some("path") {
                return SocketFrame::Completed;
            }
            SocketFrame::Ignored
        }
        Ok(_) => SocketFrame::Ignored,
        Err(_) => {
            if text.chars().count() > 100
                && (text.contains("报告") || text.to_lowercase().contains("report"))
            {
                SocketFrame::Report(text.to_string())
            } else {
                SocketFrame::Ignored
            }
        }
    }
}

/// `start {json}` command opening a research session.
pub fn start_command(task: &str, report_type: &str, tone: Tone) -> Result<String, ProviderError> {
    let body = serde_json::to_string(&ReportRequest::new(task, report_type, tone))?;
    Ok(format!("start {body}"))
}

/// The research backend's WebSocket endpoint.
pub struct WsReportSocket {
    url: String,
    read_timeout: Duration,
}

impl WsReportSocket {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), read_timeout: SOCKET_READ_TIMEOUT }
    }

    /// Idle time before a keep-alive `ping` is sent.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
}

#[async_trait]
impl ProgressiveSocket for WsReportSocket {
    async fn run(
        &self,
        command: String,
        tx: mpsc::Sender<BridgeMessage>,
    ) -> Result<(), ProviderError> {
        let socket_err = |e: tokio_tungstenite::tungstenite::Error| ProviderError::Socket(e.to_string());
        tracing::info!(target: "chatgate::provider", url = %self.url, "connecting research socket");
        let (mut ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(socket_err)?;
        ws.send(Message::Text(command)).await.map_err(socket_err)?;

        loop {
            if tx.is_closed() {
                tracing::info!(target: "chatgate::provider", "research consumer gone, closing socket");
                let _ = ws.close(None).await;
                return Ok(());
            }
            let frame = match tokio::time::timeout(self.read_timeout, ws.next()).await {
                Err(_) => {
                    ws.send(Message::Text("ping".into())).await.map_err(socket_err)?;
                    continue;
                }
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) => return Ok(()),
                Ok(Some(Err(e))) => return Err(socket_err(e)),
                Ok(Some(Ok(Message::Text(text)))) => classify_frame(&text),
                Ok(Some(Ok(_))) => continue,
            };
            match frame {
                SocketFrame::Pong | SocketFrame::Ignored => {}
                SocketFrame::Progress(update) => {
                    if tx.send(BridgeMessage::Progress(update)).await.is_err() {
                        let _ = ws.close(None).await;
                        return Ok(());
                    }
                }
                SocketFrame::Report(report) => {
                    let _ = tx.send(BridgeMessage::Report(report)).await;
                    let _ = ws.close(None).await;
                    return Ok(());
                }
                SocketFrame::Completed => {
                    tracing::warn!(target: "chatgate::provider", "research socket completed without a report");
                    let _ = tx.send(BridgeMessage::FallbackRequired).await;
                    let _ = ws.close(None).await;
                    return Ok(());
                }
            }
        }
    }
}

/// HTTP side of the research backend.
struct ResearchClient {
    http: reqwest::Client,
    config: ResearchProviderConfig,
}

impl ResearchClient {
    fn base(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    fn report_type<'a>(&'a self, options: &'a GenerationOptions) -> &'a str {
        options
            .report_type
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.config.default_report_type)
    }

    fn tone(&self, options: &GenerationOptions) -> Tone {
        normalize_tone(options.tone.as_deref().unwrap_or(&self.config.default_tone))
    }

    fn start_command(&self, messages: &[ChatMessage], options: &GenerationOptions) -> Result<String, ProviderError> {
        start_command(&task_text(messages), self.report_type(options), self.tone(options))
    }

    /// Blocking report; falls back to the chat endpoint on timeout or HTTP 500.
    async fn report(&self, messages: &[ChatMessage], options: &GenerationOptions) -> Result<String, ProviderError> {
        let task = task_text(messages);
        let body = ReportRequest::new(&task, self.report_type(options), self.tone(options));
        let task_preview: String = task.chars().take(50).collect();
        tracing::info!(target: "chatgate::provider", task = %task_preview, "requesting research report");

        match self.report_endpoint(&body).await {
            Ok(text) => Ok(text),
            Err(e) if e.allows_fallback() => {
                tracing::warn!(
                    target: "chatgate::provider",
                    error = %e,
                    "report endpoint failed, falling back to chat endpoint"
                );
                self.chat_endpoint(messages).await
            }
            Err(e) => Err(e),
        }
    }

    async fn report_endpoint(&self, body: &ReportRequest<'_>) -> Result<String, ProviderError> {
        let res = self
            .http
            .post(format!("{}/report/", self.base()))
            .json(body)
            .send()
            .await
            .map_err(|e| timeout_or_http(e, self.config.timeout()))?;
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            return Err(ProviderError::Status { status: status.as_u16(), body: text });
        }
        let parsed: ReportResponse = serde_json::from_str(&text)?;
        if let Some(err) = upstream_error(parsed.error) {
            return Err(err);
        }
        let report = parsed.report.unwrap_or_default();
        let info = parsed.research_information.unwrap_or_default();
        Ok(append_references(&report, &info.source_urls, &info.visited_urls))
    }

    async fn chat_endpoint(&self, messages: &[ChatMessage]) -> Result<String, ProviderError> {
        let res = self
            .http
            .post(format!("{}/api/chat", self.base()))
            .json(&ChatFallbackRequest { report: "", messages })
            .send()
            .await
            .map_err(|e| timeout_or_http(e, self.config.timeout()))?;
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            return Err(ProviderError::Status { status: status.as_u16(), body: text });
        }
        let parsed: ChatFallbackResponse = serde_json::from_str(&text)?;
        if let Some(err) = upstream_error(parsed.error) {
            return Err(err);
        }
        let Some(message) = parsed.response else {
            return Ok(String::new());
        };
        let references = message.metadata.as_ref().map(tool_call_references).unwrap_or_default();
        Ok(append_reference_lines(&message.content, &references))
    }
}

fn timeout_or_http(e: reqwest::Error, limit: Duration) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(limit)
    } else {
        ProviderError::Http(e)
    }
}

pub struct ResearchProvider {
    client: Arc<ResearchClient>,
    socket: Arc<dyn ProgressiveSocket>,
    bridge: BridgeConfig,
    chunk_chars: usize,
    chunk_delay: Duration,
}

impl ResearchProvider {
    pub fn new(config: ResearchProviderConfig) -> Result<Self, ProviderError> {
        let socket = Arc::new(WsReportSocket::new(config.socket_url()));
        Self::with_socket(config, socket)
    }

    pub fn with_socket(
        config: ResearchProviderConfig,
        socket: Arc<dyn ProgressiveSocket>,
    ) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder().timeout(config.timeout()).build()?;
        let bridge = BridgeConfig {
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            heartbeat_after: Duration::from_secs(config.heartbeat_secs),
            global_timeout: config.timeout(),
            grace: Duration::from_secs(config.grace_secs),
            ..BridgeConfig::default()
        };
        Ok(Self {
            chunk_chars: config.chunk_chars,
            chunk_delay: Duration::from_millis(config.chunk_delay_ms),
            client: Arc::new(ResearchClient { http, config }),
            socket,
            bridge,
        })
    }

    pub fn with_bridge_config(mut self, bridge: BridgeConfig) -> Self {
        self.bridge = bridge;
        self
    }
}

#[async_trait]
impl CompletionProvider for ResearchProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Research
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<String, ProviderError> {
        self.client.report(messages, options).await
    }

    fn complete_stream(
        &self,
        messages: Vec<ChatMessage>,
        options: GenerationOptions,
        progress: Option<ProgressSink>,
    ) -> ProviderStream {
        let client = Arc::clone(&self.client);
        let socket = Arc::clone(&self.socket);
        let bridge_config = self.bridge.clone();
        let (chunk_chars, chunk_delay) = (self.chunk_chars, self.chunk_delay);

        boxed_stream(async_stream::try_stream! {
            let mut report = None;
            let mut failure = None;
            if let Some(sink) = progress {
                let command = client.start_command(&messages, &options)?;
                let capacity = bridge_config.capacity;
                let limit = bridge_config.global_timeout + bridge_config.grace;
                let rx = bridge::spawn_session(socket, command, capacity, limit)?;
                let mut steps = Box::pin(bridge::consume(rx, sink, bridge_config));
                while let Some(step) = steps.next().await {
                    match step {
                        BridgeStep::Flush => {
                            yield ProviderChunk::Flush;
                        }
                        BridgeStep::Finished(BridgeOutcome::Report(text)) => {
                            report = Some(text);
                        }
                        BridgeStep::Finished(BridgeOutcome::Failed(reason)) => {
                            failure = Some(reason);
                        }
                        BridgeStep::Finished(BridgeOutcome::Fallback(reason)) => {
                            tracing::warn!(
                                target: "chatgate::provider",
                                reason = ?reason,
                                "progressive research fell back to the report endpoint"
                            );
                        }
                    }
                }
            }
            if let Some(reason) = failure {
                Err::<(), ProviderError>(ProviderError::Socket(reason))?;
            }
            let text = match report {
                Some(text) => text,
                None => client.report(&messages, &options).await?,
            };
            let mut chunks = Box::pin(pseudo_stream(text, chunk_chars, chunk_delay));
            while let Some(chunk) = chunks.next().await {
                yield ProviderChunk::Delta(chunk);
            }
        })
    }
}
