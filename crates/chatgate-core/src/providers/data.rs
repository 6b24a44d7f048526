//! Data-analysis provider: an OpenAI-compatible endpoint that streams
//! natively. Chunks are passed through as they arrive.

use super::wire;
use super::{boxed_stream, CompletionProvider, ProgressSink, ProviderChunk, ProviderId, ProviderStream};
use crate::config::DataProviderConfig;
use crate::error::ProviderError;
use crate::types::{ChatMessage, GenerationOptions};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct CompletionRequest<'a> {
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
    extra: &'a serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct DataAnalysisProvider {
    client: reqwest::Client,
    config: DataProviderConfig,
}

impl DataAnalysisProvider {
    pub fn new(config: DataProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Ok(Self { client, config })
    }

    fn request(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
        stream: bool,
    ) -> reqwest::RequestBuilder {
        let body = CompletionRequest {
            model: options.model.as_deref().unwrap_or(&self.config.model),
            messages,
            stream,
            temperature: options.temperature,
            top_p: options.top_p,
            max_tokens: options.max_tokens,
            extra: &options.extra,
        };
        self.client
            .post(self.config.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&body)
    }
}

/// Text of one streamed chunk, if it carries any.
fn delta_text(payload: &str) -> Result<Option<String>, serde_json::Error> {
    let chunk: StreamChunk = serde_json::from_str(payload)?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|s| !s.is_empty()))
}

#[async_trait]
impl CompletionProvider for DataAnalysisProvider {
    fn id(&self) -> ProviderId {
        ProviderId::DataAnalysis
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<String, ProviderError> {
        let res = wire::checked(self.request(messages, options, false).send().await?).await?;
        let parsed: CompletionResponse = res.json().await?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
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
                match delta_text(&payload) {
                    Ok(Some(text)) => {
                        yield ProviderChunk::Delta(text);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::debug!(
                            target: "chatgate::provider",
                            provider = "data-analysis",
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

    fn provider(base_url: String) -> DataAnalysisProvider {
        DataAnalysisProvider::new(DataProviderConfig {
            base_url,
            timeout_secs: 5,
            ..DataProviderConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn delta_text_reads_openai_chunks() {
        assert_eq!(
            delta_text(r#"{"choices":[{"delta":{"content":"x"}}]}"#).unwrap().as_deref(),
            Some("x")
        );
        assert_eq!(delta_text(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(), None);
        assert_eq!(delta_text(r#"{"choices":[]}"#).unwrap(), None);
        assert!(delta_text("nope").is_err());
    }

    #[tokio::test]
    async fn stream_passes_deltas_through() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Mean \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"is 4.2\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer dummy")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let chunks: Vec<ProviderChunk> = provider(server.url())
            .complete_stream(vec![ChatMessage::user("average of column b")], GenerationOptions::default(), None)
            .try_collect()
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(
            chunks,
            vec![ProviderChunk::Delta("Mean ".into()), ProviderChunk::Delta("is 4.2".into())]
        );
    }

    #[tokio::test]
    async fn blocking_call_reads_message_content() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"42 rows"}}]}"#)
            .create_async()
            .await;
        let text = provider(server.url())
            .complete(&[ChatMessage::user("count rows")], &GenerationOptions::default())
            .await
            .unwrap();
        assert_eq!(text, "42 rows");
    }

    #[tokio::test]
    async fn sampling_options_reach_the_backend() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_body(mockito::Matcher::PartialJson(json!({"top_p": 0.5, "temperature": 0.25, "seed": 7})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"content":"ok"}}]}"#)
            .create_async()
            .await;
        let mut options = GenerationOptions {
            temperature: Some(0.25),
            top_p: Some(0.5),
            ..GenerationOptions::default()
        };
        options.extra.insert("seed".into(), json!(7));
        let text = provider(server.url())
            .complete(&[ChatMessage::user("summarize")], &options)
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(text, "ok");
    }
}
