// [[AXON]]/apps/kernel-server/src/providers/anthropic.rs
// Purpose: Anthropic messages adapter. Typed SSE events, split token accounting.
// Architecture: Provider Adapter
// Dependencies: reqwest, serde_json, tokio

use crate::providers::sse::{self, SseLineBuffer};
use crate::providers::{
    http_client, request_error, ChunkStream, LlmChunk, LlmConfig, LlmMessage, LlmProvider,
    LlmResponse, ProviderError, Role, CHUNK_BUFFER,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

pub const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const PROVIDER: &str = "anthropic";

/// Anthropic Claude provider.
///
/// The messages API differs from the OpenAI grammar in three ways that
/// matter here: the system prompt is a top-level field rather than a
/// message, auth uses `x-api-key`, and streaming emits typed events with
/// token usage split between `message_start` (input) and `message_delta`
/// (output).
pub struct AnthropicProvider {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        AnthropicProvider {
            api_key,
            base_url: base_url.unwrap_or_else(|| ANTHROPIC_API_URL.to_string()),
            http: http_client(),
        }
    }

    /// Lift any system message out of the array into the top-level field.
    fn build_payload<'a>(
        messages: &'a [LlmMessage],
        config: &'a LlmConfig,
        stream: bool,
    ) -> MessagesRequest<'a> {
        let mut system = None;
        let mut wire = Vec::new();
        for message in messages {
            match message.role {
                Role::System => system = Some(message.content.as_str()),
                _ => wire.push(WireMessage {
                    role: message.role.as_str(),
                    content: &message.content,
                }),
            }
        }
        MessagesRequest {
            model: &config.model,
            messages: wire,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            stream,
            system,
        }
    }

    fn request(&self, payload: &MessagesRequest<'_>) -> reqwest::RequestBuilder {
        self.http
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(payload)
    }
}

fn classify_status(status: StatusCode, body: String) -> ProviderError {
    match status.as_u16() {
        401 => ProviderError::auth(PROVIDER),
        429 => ProviderError::rate_limit(PROVIDER),
        code => ProviderError::api(PROVIDER, format!("HTTP {}: {}", code, body)),
    }
}

/// Apply one typed SSE event. Input tokens arrive once on message_start,
/// output tokens accumulate through message_delta; both add into the
/// running total. Unknown or malformed events are skipped.
fn apply_stream_event(data: &str, tokens_used: &mut u32) -> Option<String> {
    let value: Value = serde_json::from_str(data).ok()?;
    match value.get("type").and_then(Value::as_str)? {
        "content_block_delta" => {
            let text = value.pointer("/delta/text")?.as_str()?;
            if text.is_empty() {
                None
            } else {
                Some(text.to_string())
            }
        }
        "message_start" => {
            if let Some(input) = value
                .pointer("/message/usage/input_tokens")
                .and_then(Value::as_u64)
            {
                *tokens_used += input as u32;
            }
            None
        }
        "message_delta" => {
            if let Some(output) = value
                .pointer("/usage/output_tokens")
                .and_then(Value::as_u64)
            {
                *tokens_used += output as u32;
            }
            None
        }
        _ => None,
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn stream(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<ChunkStream, ProviderError> {
        let payload = Self::build_payload(messages, config, true);
        let response = self
            .request(&payload)
            .send()
            .await
            .map_err(|e| request_error(PROVIDER, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
        let model = config.model.clone();
        tokio::spawn(async move {
            let mut lines = SseLineBuffer::new();
            let mut tokens_used = 0u32;
            let mut body = response.bytes_stream();

            // No [DONE] sentinel: the server closes the stream after
            // message_stop.
            while let Some(item) = body.next().await {
                let Ok(bytes) = item else {
                    break;
                };
                for line in lines.push(&bytes) {
                    let Some(data) = sse::data_payload(&line) else {
                        continue;
                    };
                    if let Some(text) = apply_stream_event(data, &mut tokens_used) {
                        if tx.send(LlmChunk::text(text)).await.is_err() {
                            return;
                        }
                    }
                }
            }

            tracing::debug!(
                "anthropic stream complete, model={}, tokens={}",
                model,
                tokens_used
            );
            let _ = tx.send(LlmChunk::last(tokens_used)).await;
        });

        Ok(rx)
    }

    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, ProviderError> {
        let payload = Self::build_payload(messages, config, false);
        let response = self
            .request(&payload)
            .send()
            .await
            .map_err(|e| request_error(PROVIDER, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| request_error(PROVIDER, e))?;
        if !status.is_success() {
            return Err(classify_status(status, body));
        }

        let value: Value = serde_json::from_str(&body)
            .map_err(|_| ProviderError::api(PROVIDER, "malformed response body"))?;
        let content = value
            .pointer("/content/0/text")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::api(PROVIDER, "response missing content text"))?;
        let input = value
            .pointer("/usage/input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let output = value
            .pointer("/usage/output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        Ok(LlmResponse {
            content: content.to_string(),
            tokens_used: (input + output) as u32,
            model: config.model.clone(),
        })
    }

    fn validate_api_key(&self, api_key: &str) -> bool {
        api_key.starts_with("sk-ant-") && api_key.len() > 20
    }
}
