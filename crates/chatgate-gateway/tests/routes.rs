use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use chatgate_core::config::GatewayConfig;
use chatgate_core::providers::{CompletionProvider, ProgressSink, ProviderChunk, ProviderId, ProviderSet, ProviderStream};
use chatgate_core::types::{ChatMessage, GenerationOptions};
use chatgate_core::{Coordinator, EvidenceRetriever, ProviderError, SledHistoryStore};
use chatgate_gateway::{router, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

/// Answers with a fixed text, or fails when `fail` is set.
struct EchoProvider {
    id: ProviderId,
    answer: &'static str,
    fail: bool,
}

#[async_trait]
impl CompletionProvider for EchoProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    async fn complete(&self, _: &[ChatMessage], _: &GenerationOptions) -> Result<String, ProviderError> {
        if self.fail {
            return Err(ProviderError::Status { status: 503, body: "overloaded".into() });
        }
        Ok(self.answer.to_string())
    }

    fn complete_stream(
        &self,
        _: Vec<ChatMessage>,
        _: GenerationOptions,
        _: Option<ProgressSink>,
    ) -> ProviderStream {
        let chunks: Vec<Result<ProviderChunk, ProviderError>> = self
            .answer
            .split_inclusive(' ')
            .map(|piece| Ok(ProviderChunk::Delta(piece.to_string())))
            .collect();
        Box::pin(futures_util::stream::iter(chunks))
    }
}

fn app(fail: bool) -> axum::Router {
    let provider = |id: ProviderId| -> Arc<dyn CompletionProvider> {
        Arc::new(EchoProvider { id, answer: "Tea began in China.", fail })
    };
    let providers = ProviderSet {
        general: provider(ProviderId::General),
        research: provider(ProviderId::Research),
        data: provider(ProviderId::DataAnalysis),
    };
    let coordinator = Coordinator::new(
        GatewayConfig::default(),
        EvidenceRetriever::disabled(),
        providers,
        Arc::new(SledHistoryStore::temporary().unwrap()),
    );
    router(AppState::new(coordinator))
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_is_ok() {
    let response = app(false).oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"OK");
}

#[tokio::test]
async fn blocking_chat_returns_reply() {
    let response = app(false)
        .oneshot(post_json("/chat", json!({"message": "tell me about tea", "sessionId": "s1"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["sessionId"], "s1");
    assert_eq!(body["content"], "Tea began in China.");
    assert_eq!(body["evidence"], json!([]));
    assert_eq!(body["sources"], json!({"local": [], "web": []}));
    assert_eq!(body["history"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn empty_message_is_a_bad_request() {
    for uri in ["/chat", "/chat/stream"] {
        let response = app(false)
            .oneshot(post_json(uri, json!({"message": "   "})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["message"].as_str().unwrap().contains("message"));
    }
}

#[tokio::test]
async fn provider_failure_is_a_bad_gateway() {
    let response = app(true)
        .oneshot(post_json("/chat", json!({"message": "hello"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = json_body(response).await;
    assert!(body["message"].as_str().unwrap().contains("503"));
}

#[tokio::test]
async fn stream_emits_sse_frames_in_order() {
    let response = app(false)
        .oneshot(post_json("/chat/stream", json!({"message": "tell me about tea", "session_id": "s2"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert!(headers[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/event-stream"));
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
    assert_eq!(headers["x-accel-buffering"], "no");

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let frames: Vec<Value> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();

    let kinds: Vec<&str> = frames.iter().map(|f| f["type"].as_str().unwrap()).collect();
    assert_eq!(kinds.first(), Some(&"start"));
    assert_eq!(kinds.get(1), Some(&"evidence"));
    assert_eq!(kinds.last(), Some(&"done"));
    assert_eq!(frames[0]["sessionId"], "s2");
    let answer: String = frames
        .iter()
        .filter(|f| f["type"] == "chunk")
        .map(|f| f["content"].as_str().unwrap())
        .collect();
    assert_eq!(answer, "Tea began in China.");
}

#[tokio::test]
async fn history_sessions_and_delete() {
    let app = app(false);
    let response = app
        .clone()
        .oneshot(post_json("/chat", json!({"message": "first question", "sessionId": "s3"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let history = json_body(app.clone().oneshot(get("/chat/history?sessionId=s3")).await.unwrap()).await;
    assert_eq!(history["sessionId"], "s3");
    let messages = history["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[0]["content"], "first question");
    assert!(messages[1]["time"].is_string());

    let sessions = json_body(app.clone().oneshot(get("/chat/sessions?limit=5")).await.unwrap()).await;
    assert_eq!(sessions["sessions"][0]["id"], "s3");

    let request = Request::builder()
        .method("DELETE")
        .uri("/chat/sessions/s3")
        .body(Body::empty())
        .unwrap();
    let deleted = json_body(app.clone().oneshot(request).await.unwrap()).await;
    assert_eq!(deleted["deleted"], true);

    let history = json_body(app.clone().oneshot(get("/chat/history?sessionId=s3")).await.unwrap()).await;
    assert_eq!(history["messages"], json!([]));
}

#[tokio::test]
async fn history_requires_a_session_id() {
    let response = app(false).oneshot(get("/chat/history")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
