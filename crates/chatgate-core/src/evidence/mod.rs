//! Evidence retrieval: decide whether to search, query both collaborators,
//! merge the results and fold them into the system prompt.

pub mod local;
pub mod web;

pub use local::{HttpLocalSearch, LocalSearch};
pub use web::{SearchCache, TavilySearch, WebSearch};

use crate::config::RetrievalConfig;
use crate::types::{ChatMessage, EvidenceItem, EvidenceOrigin};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Terms that suggest the local news/event index can help.
pub const LOCAL_TRIGGERS: &[&str] = &[
    "新闻", "事件", "发布", "公告", "动态", "发生", "最近", "最新", "有哪些", "变化", "更新",
    "news", "event", "announcement", "announced", "latest", "recent", "update",
];

/// Terms that suggest fresh web results are needed.
pub const WEB_TRIGGERS: &[&str] = &[
    "最新", "最近", "新闻", "政策", "发布", "进展", "研究", "报道", "公告", "行业",
    "latest", "recent", "news", "policy", "progress", "research", "industry",
];

const SUMMARY_LIMIT: usize = 500;

const EVIDENCE_INSTRUCTIONS: &str = "Prefer the [Local knowledge base] evidence when answering and \
cite [Web search] only when needed. Do not print a list of sources in the answer body; sources \
are attached separately. If the evidence is insufficient, say so plainly instead of making \
things up.";

fn mentions_any(text: &str, terms: &[&str]) -> bool {
    let lowered = text.to_lowercase();
    terms.iter().any(|t| lowered.contains(t))
}

/// Outcome of one retrieval pass.
#[derive(Debug, Clone, Default)]
pub struct Retrieval {
    pub local: Vec<EvidenceItem>,
    pub web: Vec<EvidenceItem>,
}

impl Retrieval {
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.web.is_empty()
    }

    /// Merged, deduped evidence with local items first.
    pub fn merged(&self) -> Vec<EvidenceItem> {
        merge_evidence(self.local.clone(), self.web.clone())
    }
}

/// Optional collaborators plus limits. Either collaborator may be absent.
pub struct EvidenceRetriever {
    local: Option<Arc<dyn LocalSearch>>,
    web: Option<Arc<dyn WebSearch>>,
    config: RetrievalConfig,
}

impl EvidenceRetriever {
    pub fn new(
        local: Option<Arc<dyn LocalSearch>>,
        web: Option<Arc<dyn WebSearch>>,
        config: RetrievalConfig,
    ) -> Self {
        Self { local, web, config }
    }

    /// A retriever with no collaborators; every pass returns nothing.
    pub fn disabled() -> Self {
        Self::new(None, None, RetrievalConfig::default())
    }

    /// Run whichever searches the flags or trigger keywords call for. Failures
    /// are logged and treated as "no results".
    pub async fn retrieve(&self, message: &str, use_local: bool, use_web: bool) -> Retrieval {
        let local_triggered = use_local || mentions_any(message, LOCAL_TRIGGERS);
        let web_triggered = use_web || mentions_any(message, WEB_TRIGGERS);
        if !(local_triggered || web_triggered) {
            return Retrieval::default();
        }
        if web_triggered && !self.config.web_enabled {
            tracing::warn!(target: "chatgate::evidence", "web search triggered but disabled by configuration");
        }

        let local_fut = async {
            let Some(local) = &self.local else { return Vec::new() };
            match local
                .search(message, self.config.local_top_k, self.config.local_min_similarity)
                .await
            {
                Ok(items) => items,
                Err(e) => {
                    tracing::warn!(target: "chatgate::evidence", error = %e, "local search failed");
                    Vec::new()
                }
            }
        };
        let web_fut = async {
            if !self.config.web_enabled {
                return Vec::new();
            }
            let Some(web) = &self.web else { return Vec::new() };
            match web
                .search(
                    message,
                    self.config.web_top_n,
                    self.config.web_min_score,
                    self.config.web_cache_ttl(),
                )
                .await
            {
                Ok(items) => items,
                Err(e) => {
                    tracing::warn!(target: "chatgate::evidence", error = %e, "web search failed");
                    Vec::new()
                }
            }
        };
        let (local, web) = tokio::join!(local_fut, web_fut);

        tracing::info!(
            target: "chatgate::evidence",
            local = local.len(),
            web = web.len(),
            "retrieval finished"
        );
        Retrieval { local, web }
    }
}

/// Concatenate local then web items, keeping the first item per dedup key.
/// Items are re-tagged with the origin of the list they came from.
pub fn merge_evidence(local: Vec<EvidenceItem>, web: Vec<EvidenceItem>) -> Vec<EvidenceItem> {
    let mut seen = HashSet::new();
    let local = local.into_iter().map(|mut i| {
        i.origin = EvidenceOrigin::Local;
        i
    });
    let web = web.into_iter().map(|mut i| {
        i.origin = EvidenceOrigin::Web;
        i
    });
    local
        .chain(web)
        .filter(|item| {
            let key = item.dedup_key();
            !key.is_empty() && seen.insert(key.to_string())
        })
        .collect()
}

fn or_unknown(value: &str, fallback: &'static str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

fn truncate_summary(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() > SUMMARY_LIMIT {
        let cut: String = text.chars().take(SUMMARY_LIMIT).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

/// The `[Local knowledge base]` / `[Web search]` sections, or `None` when
/// both lists are empty.
pub fn format_evidence_block(evidence: &[EvidenceItem]) -> Option<String> {
    let local: Vec<&EvidenceItem> =
        evidence.iter().filter(|i| i.origin == EvidenceOrigin::Local).collect();
    let web: Vec<&EvidenceItem> =
        evidence.iter().filter(|i| i.origin == EvidenceOrigin::Web).collect();
    let mut sections = Vec::new();

    if !local.is_empty() {
        let mut lines = vec!["[Local knowledge base]".to_string()];
        for (idx, item) in local.iter().enumerate() {
            let similarity = item
                .relevance
                .map(|s| format!("{s:.3}"))
                .unwrap_or_else(|| "unknown".into());
            let mut header = format!(
                "{}. {} (time: {}, source: {}, similarity: {})",
                idx + 1,
                or_unknown(&item.title, "untitled"),
                or_unknown(item.published_at.as_deref().unwrap_or_default(), "unknown"),
                or_unknown(&item.source, "unknown"),
                similarity
            );
            if !item.url.is_empty() {
                header.push_str(&format!(" | link: {}", item.url));
            }
            lines.push(header);
            let summary = truncate_summary(&item.summary);
            if !summary.is_empty() {
                lines.push(format!("   summary: {summary}"));
            }
        }
        sections.push(lines.join("\n"));
    }

    if !web.is_empty() {
        let mut lines = vec!["[Web search]".to_string()];
        for (idx, item) in web.iter().enumerate() {
            let mut header = format!(
                "{}. {} (time: {}, source: {})",
                idx + 1,
                or_unknown(&item.title, "untitled"),
                or_unknown(item.published_at.as_deref().unwrap_or_default(), "unknown"),
                or_unknown(&item.source, "unknown"),
            );
            if !item.url.is_empty() {
                header.push_str(&format!(" | link: {}", item.url));
            }
            lines.push(header);
            if !item.summary.trim().is_empty() {
                lines.push(format!("   summary: {}", item.summary.trim()));
            }
        }
        sections.push(lines.join("\n"));
    }

    if sections.is_empty() {
        None
    } else {
        Some(sections.join("\n\n"))
    }
}

/// System prompt (with evidence when present), then history, then the user turn.
pub fn assemble_messages(
    system_prompt: &str,
    history: &[ChatMessage],
    user_message: &str,
    evidence: &[EvidenceItem],
) -> Vec<ChatMessage> {
    let system = match format_evidence_block(evidence) {
        Some(block) => {
            let base = if system_prompt.trim().is_empty() {
                "You are a helpful assistant."
            } else {
                system_prompt
            };
            Some(format!("{base}\n\n{EVIDENCE_INSTRUCTIONS}\n{block}"))
        }
        None if !system_prompt.trim().is_empty() => Some(system_prompt.to_string()),
        None => None,
    };
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.extend(system.map(ChatMessage::system));
    messages.extend(history.iter().cloned());
    messages.push(ChatMessage::user(user_message));
    messages
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    pub title: String,
    pub url: String,
    pub source: String,
    pub published_at: Option<String>,
    pub origin: EvidenceOrigin,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourcesPayload {
    pub local: Vec<SourceRef>,
    pub web: Vec<SourceRef>,
}

/// Evidence grouped by origin for the client, each group deduped by url-or-title.
pub fn sources_payload(evidence: &[EvidenceItem]) -> SourcesPayload {
    let mut payload = SourcesPayload::default();
    let mut seen_local = HashSet::new();
    let mut seen_web = HashSet::new();
    for item in evidence {
        let key = item.dedup_key();
        if key.is_empty() {
            continue;
        }
        let (group, seen) = match item.origin {
            EvidenceOrigin::Local => (&mut payload.local, &mut seen_local),
            EvidenceOrigin::Web => (&mut payload.web, &mut seen_web),
        };
        if !seen.insert(key.to_string()) {
            continue;
        }
        let title = [item.title.trim(), item.url.trim(), item.source.trim()]
            .into_iter()
            .find(|s| !s.is_empty())
            .unwrap_or("unknown source")
            .to_string();
        group.push(SourceRef {
            title,
            url: item.url.trim().to_string(),
            source: item.source.trim().to_string(),
            published_at: item.published_at.clone(),
            origin: item.origin,
        });
    }
    payload
}
