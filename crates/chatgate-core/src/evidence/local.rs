//! Local semantic index collaborator.

use crate::error::RetrievalError;
use crate::types::{EvidenceItem, EvidenceOrigin};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const LOCAL_SEARCH_TIMEOUT: Duration = Duration::from_secs(20);

#[async_trait]
pub trait LocalSearch: Send + Sync {
    async fn search(
        &self,
        query: &str,
        k: usize,
        min_similarity: f64,
    ) -> Result<Vec<EvidenceItem>, RetrievalError>;
}

/// Semantic search over HTTP: POST `{query, k, min_similarity}`, expects a
/// JSON array of hits or `{"results": [...]}`.
pub struct HttpLocalSearch {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpLocalSearch {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, RetrievalError> {
        let client = reqwest::Client::builder().timeout(LOCAL_SEARCH_TIMEOUT).build()?;
        Ok(Self { client, endpoint: endpoint.into() })
    }
}

#[derive(Serialize)]
struct LocalSearchRequest<'a> {
    query: &'a str,
    k: usize,
    min_similarity: f64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LocalSearchResponse {
    Bare(Vec<LocalHit>),
    Wrapped { results: Vec<LocalHit> },
}

#[derive(Debug, Deserialize)]
struct LocalHit {
    #[serde(default)]
    title: Option<String>,
    #[serde(default, alias = "content")]
    summary: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default, alias = "publishedAt")]
    published_at: Option<String>,
    #[serde(default, alias = "source_name")]
    source: Option<String>,
    #[serde(default)]
    similarity: Option<f64>,
}

impl From<LocalHit> for EvidenceItem {
    fn from(hit: LocalHit) -> Self {
        EvidenceItem {
            origin: EvidenceOrigin::Local,
            title: hit.title.unwrap_or_default().trim().to_string(),
            summary: hit.summary.unwrap_or_default(),
            url: hit.url.unwrap_or_default().trim().to_string(),
            published_at: hit.published_at.filter(|s| !s.trim().is_empty()),
            source: hit.source.unwrap_or_default(),
            relevance: hit.similarity,
        }
    }
}

#[async_trait]
impl LocalSearch for HttpLocalSearch {
    async fn search(
        &self,
        query: &str,
        k: usize,
        min_similarity: f64,
    ) -> Result<Vec<EvidenceItem>, RetrievalError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let res = self
            .client
            .post(&self.endpoint)
            .json(&LocalSearchRequest { query, k, min_similarity })
            .send()
            .await?;
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            return Err(RetrievalError::Status { status: status.as_u16(), body: text });
        }
        let parsed: LocalSearchResponse =
            serde_json::from_str(&text).map_err(|e| RetrievalError::Decode(e.to_string()))?;
        let hits = match parsed {
            LocalSearchResponse::Bare(hits) => hits,
            LocalSearchResponse::Wrapped { results } => results,
        };
        let items: Vec<EvidenceItem> = hits.into_iter().map(EvidenceItem::from).collect();
        tracing::info!(
            target: "chatgate::evidence",
            k,
            min_similarity,
            returned = items.len(),
            "local retrieval finished"
        );
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_wrapped_results() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/search")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"results":[{"title":"Policy update","summary":"New rules","url":"https://a.example/1","published_at":"2024-05-01","source_name":"gov","similarity":0.71}]}"#,
            )
            .create_async()
            .await;

        let search = HttpLocalSearch::new(format!("{}/search", server.url())).unwrap();
        let items = search.search("policy", 8, 0.4).await.unwrap();
        mock.assert_async().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].origin, EvidenceOrigin::Local);
        assert_eq!(items[0].source, "gov");
        assert_eq!(items[0].relevance, Some(0.71));
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/search")
            .with_status(503)
            .with_body("down")
            .create_async()
            .await;
        let search = HttpLocalSearch::new(format!("{}/search", server.url())).unwrap();
        let err = search.search("policy", 8, 0.4).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn blank_query_skips_the_request() {
        let search = HttpLocalSearch::new("http://127.0.0.1:9/unused").unwrap();
        assert!(search.search("   ", 8, 0.4).await.unwrap().is_empty());
    }
}
