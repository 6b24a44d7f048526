//! Web search collaborator (Tavily) and the process-wide result cache.

use crate::error::RetrievalError;
use crate::types::{EvidenceItem, EvidenceOrigin};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::time::{Duration, Instant};

pub const TAVILY_SEARCH_URL: &str = "https://api.tavily.com/search";
const WEB_SEARCH_TIMEOUT: Duration = Duration::from_secs(25);
const SNIPPET_LIMIT: usize = 260;

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
        min_score: f64,
        ttl: Duration,
    ) -> Result<Vec<EvidenceItem>, RetrievalError>;
}

struct CacheEntry {
    items: Vec<EvidenceItem>,
    expires_at: Instant,
}

/// Search results keyed by a hash of the normalized query and its limits.
/// Expired entries are evicted when looked up and swept on every insert.
#[derive(Default)]
pub struct SearchCache {
    entries: DashMap<String, CacheEntry>,
}

impl SearchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(query: &str, max_results: usize, min_score: f64) -> String {
        let normalized = collapse_whitespace(query).to_lowercase();
        let raw = format!("{max_results}:{min_score}:{normalized}");
        hex::encode(Sha256::digest(raw.as_bytes()))
    }

    pub fn get(&self, key: &str) -> Option<Vec<EvidenceItem>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Some(entry.items.clone());
            }
        }
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    pub fn insert(&self, key: String, items: Vec<EvidenceItem>, ttl: Duration) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
        self.entries.insert(key, CacheEntry { items, expires_at: now + ttl });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct TavilySearch {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    search_depth: String,
    cache: SearchCache,
}

impl TavilySearch {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        search_depth: impl Into<String>,
    ) -> Result<Self, RetrievalError> {
        let client = reqwest::Client::builder().timeout(WEB_SEARCH_TIMEOUT).build()?;
        let search_depth = search_depth.into();
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            search_depth: if search_depth.trim().is_empty() { "basic".into() } else { search_depth },
            cache: SearchCache::new(),
        })
    }

    pub fn cache(&self) -> &SearchCache {
        &self.cache
    }
}

#[derive(Serialize)]
struct TavilyRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    search_depth: &'a str,
    max_results: usize,
    include_answer: bool,
    include_images: bool,
    include_raw_content: bool,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyHit>,
}

#[derive(Debug, Default, Deserialize)]
struct TavilyHit {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default, alias = "snippet")]
    content: Option<String>,
    #[serde(default, alias = "published_time", alias = "published", alias = "date")]
    published_date: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    score: Option<f64>,
}

#[async_trait]
impl WebSearch for TavilySearch {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
        min_score: f64,
        ttl: Duration,
    ) -> Result<Vec<EvidenceItem>, RetrievalError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let key = SearchCache::key(query, max_results, min_score);
        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!(target: "chatgate::evidence", cached = hit.len(), "web search cache hit");
            return Ok(hit);
        }
        if self.api_key.trim().is_empty() {
            return Err(RetrievalError::NotConfigured("web search api key"));
        }

        let body = TavilyRequest {
            api_key: self.api_key.trim(),
            query,
            search_depth: &self.search_depth,
            max_results,
            include_answer: false,
            include_images: false,
            include_raw_content: false,
        };
        let res = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            return Err(RetrievalError::Status { status: status.as_u16(), body: text });
        }
        let parsed: TavilyResponse =
            serde_json::from_str(&text).map_err(|e| RetrievalError::Decode(e.to_string()))?;

        let items = normalize_hits(parsed.results, min_score);
        tracing::info!(
            target: "chatgate::evidence",
            max_results,
            returned = items.len(),
            "web search finished"
        );
        self.cache.insert(key, items.clone(), ttl);
        Ok(items)
    }
}

fn normalize_hits(hits: Vec<TavilyHit>, min_score: f64) -> Vec<EvidenceItem> {
    let mut seen = HashSet::new();
    hits.into_iter()
        .map(normalize_hit)
        .filter(|item| !item.url.is_empty() && !item.title.is_empty())
        .filter(|item| min_score <= 0.0 || item.relevance.map_or(true, |s| s >= min_score))
        .filter(|item| seen.insert(item.dedup_key().to_string()))
        .collect()
}

fn normalize_hit(hit: TavilyHit) -> EvidenceItem {
    let url = hit.url.unwrap_or_default().trim().to_string();
    let source = hit
        .source
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| host_of(&url));
    EvidenceItem {
        origin: EvidenceOrigin::Web,
        title: hit.title.unwrap_or_default().trim().to_string(),
        summary: truncate_snippet(hit.content.as_deref().unwrap_or_default(), SNIPPET_LIMIT),
        published_at: hit.published_date.as_deref().and_then(normalize_date),
        url,
        source,
        relevance: hit.score,
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whitespace-collapsed text cut to `limit` characters, with `...` when cut.
pub fn truncate_snippet(text: &str, limit: usize) -> String {
    let cleaned = collapse_whitespace(text);
    if cleaned.chars().count() <= limit {
        return cleaned;
    }
    let cut: String = cleaned.chars().take(limit).collect();
    format!("{}...", cut.trim_end())
}

pub fn host_of(raw: &str) -> String {
    url::Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

/// Normalize a publish timestamp to `YYYY-MM-DD`.
pub fn normalize_date(raw: &str) -> Option<String> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(text) {
        return Some(dt.date_naive().to_string());
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(text) {
        return Some(dt.date_naive().to_string());
    }
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.date().to_string());
    }
    let head: String = text.chars().take(10).collect();
    if head.chars().count() < 10 {
        return None;
    }
    match chrono::NaiveDate::parse_from_str(&head, "%Y-%m-%d") {
        Ok(date) => Some(date.to_string()),
        Err(_) => Some(head),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(title: &str, url: &str, score: Option<f64>) -> TavilyHit {
        TavilyHit {
            title: Some(title.into()),
            url: Some(url.into()),
            content: Some("body".into()),
            score,
            ..Default::default()
        }
    }

    #[test]
    fn snippet_is_collapsed_and_truncated() {
        assert_eq!(truncate_snippet("a   b\n\tc", 260), "a b c");
        let long = "x".repeat(300);
        let cut = truncate_snippet(&long, 260);
        assert_eq!(cut.chars().count(), 263);
        assert!(cut.ends_with("..."));
        let cjk = "字".repeat(300);
        assert_eq!(truncate_snippet(&cjk, 260).chars().count(), 263);
    }

    #[test]
    fn dates_normalize_to_calendar_day() {
        assert_eq!(normalize_date("2024-03-05T10:00:00Z").as_deref(), Some("2024-03-05"));
        assert_eq!(normalize_date("Tue, 05 Mar 2024 10:00:00 +0000").as_deref(), Some("2024-03-05"));
        assert_eq!(normalize_date("2024-03-05").as_deref(), Some("2024-03-05"));
        assert_eq!(normalize_date("yesterday"), None);
        assert_eq!(normalize_date(""), None);
    }

    #[test]
    fn hits_without_url_or_title_are_dropped_and_deduped() {
        let items = normalize_hits(
            vec![
                hit("A", "https://news.example.com/a", Some(0.9)),
                hit("", "https://news.example.com/b", Some(0.9)),
                hit("C", "", Some(0.9)),
                hit("A again", "https://news.example.com/a", Some(0.5)),
            ],
            0.0,
        );
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].source, "news.example.com");
    }

    #[test]
    fn min_score_filters_only_when_positive() {
        let hits = || vec![hit("A", "https://a.example", Some(0.2)), hit("B", "https://b.example", None)];
        assert_eq!(normalize_hits(hits(), 0.0).len(), 2);
        let filtered = normalize_hits(hits(), 0.5);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].title, "B");
    }

    #[test]
    fn cache_key_ignores_case_and_spacing() {
        assert_eq!(SearchCache::key("Latest  News", 6, 0.0), SearchCache::key("latest news", 6, 0.0));
        assert_ne!(SearchCache::key("latest news", 6, 0.0), SearchCache::key("latest news", 5, 0.0));
    }

    #[test]
    fn expired_entries_are_evicted_on_lookup() {
        let cache = SearchCache::new();
        cache.insert("k".into(), Vec::new(), Duration::from_secs(0));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
        cache.insert("k".into(), Vec::new(), Duration::from_secs(60));
        assert!(cache.get("k").is_some());
    }

    #[test]
    fn insert_sweeps_expired_entries_of_other_keys() {
        let cache = SearchCache::new();
        cache.insert("once".into(), Vec::new(), Duration::ZERO);
        cache.insert("later".into(), Vec::new(), Duration::from_secs(60));
        assert_eq!(cache.len(), 1);
        assert!(cache.get("later").is_some());
    }

    #[tokio::test]
    async fn results_are_cached_between_calls() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/search")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"results":[{"title":"Rate cut","url":"https://fin.example.com/r","content":"Central bank","score":0.8,"published_date":"2024-06-01T08:00:00Z"}]}"#)
            .expect(1)
            .create_async()
            .await;

        let search = TavilySearch::new(format!("{}/search", server.url()), "key", "basic").unwrap();
        let first = search.search("rate cut", 6, 0.0, Duration::from_secs(60)).await.unwrap();
        let second = search.search("rate cut", 6, 0.0, Duration::from_secs(60)).await.unwrap();
        mock.assert_async().await;
        assert_eq!(first, second);
        assert_eq!(first[0].published_at.as_deref(), Some("2024-06-01"));
    }

    #[tokio::test]
    async fn missing_api_key_is_a_retrieval_error() {
        let search = TavilySearch::new("http://127.0.0.1:9/search", "", "basic").unwrap();
        let err = search.search("rate cut", 6, 0.0, Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, RetrievalError::NotConfigured(_)));
    }
}
