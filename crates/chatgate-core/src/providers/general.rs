//! General chat provider: a single OpenAI-style chat endpoint with bearer auth.

use super::wire;
use super::{boxed_stream, CompletionProvider, ProgressSink, ProviderChunk, ProviderId, ProviderStream};
use crate::config::GeneralProviderConfig;
use crate::error::ProviderError;
use crate::types::{ChatMessage, GenerationOptions};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(flatten)]
    extra: &'a serde_json::Map<String, Value>,
}

pub struct GeneralProvider {
    client: reqwest::Client,
    config: GeneralProviderConfig,
}

impl GeneralProvider {
    pub fn new(config: GeneralProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Ok(Self { client, config })
    }

    fn request(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
        stream: bool,
    ) -> reqwest::RequestBuilder {
        let model = options.model.as_deref().unwrap_or(&self.config.model);
        let body = ChatRequest {
            model,
            messages,
            stream,
            temperature: options.temperature,
            top_p: options.top_p,
            max_tokens: options.max_tokens,
            extra: &options.extra,
        };
        let mut req = self.client.post(&self.config.endpoint).json(&body);
        if !self.config.api_key.is_empty() {
            req = req.bearer_auth(&self.config.api_key);
        }
        req
    }
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Incremental text from one stream payload. Accepts the OpenAI delta shape,
/// the DashScope `output` shapes and a bare top-level `text`.
pub fn parse_delta(payload: &Value) -> Option<String> {
    const POINTERS: &[&str] = &[
        "/choices/0/delta/content",
        "/output/choices/0/delta/content",
        "/output/choices/0/message/content",
        "/output/choices/0/text",
        "/output/text",
        "/text",
    ];
    POINTERS.iter().find_map(|p| non_empty(payload.pointer(p)))
}

/// Full text of a blocking response.
pub fn parse_completion(payload: &Value) -> Option<String> {
    const POINTERS: &[&str] = &[
        "/choices/0/message/content",
        "/output/text",
        "/output/choices/0/message/content",
        "/output/choices/0/text",
        "/choices/0/text",
    ];
    POINTERS.iter().find_map(|p| non_empty(payload.pointer(p)))
}

#[async_trait]
impl CompletionProvider for GeneralProvider {
    fn id(&self) -> ProviderId {
        ProviderId::General
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<String, ProviderError> {
        let res = self.request(messages, options, false).send().await?;
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            return Err(ProviderError::Status { status: status.as_u16(), body: text });
        }
        let payload: Value = serde_json::from_str(&text)?;
        Ok(parse_completion(&payload).unwrap_or_default())
    }

    fn complete_stream(
        &self,
        messages: Vec<ChatMessage>,
        options: GenerationOptions,
        _progress: Option<ProgressSink>,
    ) -> ProviderStream {
        let request = self.request(&messages, &options, true);
        boxed_stream(async_stream::try_stream! {
            let res = wire::checked(request.send().await?).await?;
            let mut payloads = Box::pin(wire::payloads(res));
            while let Some(payload) = payloads.next().await {
                let payload = payload?;
                match serde_json::from_str::<Value>(&payload) {
                    Ok(value) => {
                        if let Some(delta) = parse_delta(&value) {
                            yield ProviderChunk::Delta(delta);
                        }
                    }
                    Err(e) => {
                        tracing::debug!(
                            target: "chatgate::provider",
                            provider = "general",
                            error = %e,
                            "skipping unparsable stream line"
                        );
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;
    use serde_json::json;

    fn provider(url: String) -> GeneralProvider {
        GeneralProvider::new(GeneralProviderConfig {
            endpoint: url,
            api_key: "test-key".into(),
            model: "test-model".into(),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn delta_shapes_are_recognized() {
        assert_eq!(parse_delta(&json!({"choices":[{"delta":{"content":"a"}}]})).as_deref(), Some("a"));
        assert_eq!(
            parse_delta(&json!({"output":{"choices":[{"message":{"content":"b"}}]}})).as_deref(),
            Some("b")
        );
        assert_eq!(parse_delta(&json!({"output":{"text":"c"}})).as_deref(), Some("c"));
        assert_eq!(parse_delta(&json!({"text":"d"})).as_deref(), Some("d"));
        assert_eq!(parse_delta(&json!({"choices":[{"delta":{}}]})), None);
    }

    #[test]
    fn completion_shapes_are_recognized() {
        assert_eq!(
            parse_completion(&json!({"choices":[{"message":{"content":"full"}}]})).as_deref(),
            Some("full")
        );
        assert_eq!(parse_completion(&json!({"output":{"text":"ds"}})).as_deref(), Some("ds"));
    }

    #[tokio::test]
    async fn stream_skips_noise_and_stops_at_done() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            ": comment\n",
            "\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
            "data: not json\n",
            "data: {\"output\":{\"text\":\"lo\"}}\n",
            "data: [DONE]\n",
            "data: {\"text\":\"after done\"}\n",
        );
        let _mock = server
            .mock("POST", "/chat")
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let chunks: Vec<ProviderChunk> = provider(format!("{}/chat", server.url()))
            .complete_stream(vec![ChatMessage::user("hi")], GenerationOptions::default(), None)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(
            chunks,
            vec![ProviderChunk::Delta("Hel".into()), ProviderChunk::Delta("lo".into())]
        );
    }

    #[tokio::test]
    async fn error_status_surfaces_as_provider_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat")
            .with_status(401)
            .with_body("bad key")
            .create_async()
            .await;
        let result: Result<Vec<ProviderChunk>, _> = provider(format!("{}/chat", server.url()))
            .complete_stream(vec![ChatMessage::user("hi")], GenerationOptions::default(), None)
            .try_collect()
            .await;
        assert!(matches!(result, Err(ProviderError::Status { status: 401, .. })));
    }

    #[tokio::test]
    async fn blocking_call_returns_message_content() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"Hi!"}}]}"#)
            .create_async()
            .await;
        let text = provider(format!("{}/chat", server.url()))
            .complete(&[ChatMessage::user("hi")], &GenerationOptions::default())
            .await
            .unwrap();
        assert_eq!(text, "Hi!");
    }

    #[tokio::test]
    async fn passthrough_options_reach_the_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat")
            .match_body(mockito::Matcher::PartialJson(json!({"model": "test-model", "top_p": 0.5, "seed": 7})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"content":"seeded"}}]}"#)
            .create_async()
            .await;
        let mut options = GenerationOptions { top_p: Some(0.5), ..GenerationOptions::default() };
        options.extra.insert("seed".into(), json!(7));
        let text = provider(format!("{}/chat", server.url()))
            .complete(&[ChatMessage::user("hi")], &options)
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(text, "seeded");
    }
}
