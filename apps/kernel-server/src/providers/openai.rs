// [[AXON]]/apps/kernel-server/src/providers/openai.rs
// Purpose: OpenAI chat completions adapter (SSE streaming).
// Architecture: Provider Adapter
// Dependencies: reqwest, serde_json, tokio

use crate::providers::sse::{self, SseLineBuffer};
use crate::providers::{
    http_client, request_error, ChunkStream, LlmChunk, LlmConfig, LlmMessage, LlmProvider,
    LlmResponse, ProviderError, CHUNK_BUFFER,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

pub const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const PROVIDER: &str = "openai";

/// OpenAI API provider. Supports GPT-4o, GPT-4o-mini, o-series.
pub struct OpenAiProvider {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

impl OpenAiProvider {
    /// Custom base URLs (Azure fronts, proxies) are normalized onto the
    /// chat completions path.
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        let mut base = base_url.unwrap_or_else(|| OPENAI_API_URL.to_string());
        base = base.trim_end_matches('/').to_string();
        if !base.ends_with("/chat/completions") {
            base = format!("{}/chat/completions", base);
        }
        OpenAiProvider {
            api_key,
            base_url: base,
            http: http_client(),
        }
    }

    fn build_payload<'a>(
        messages: &'a [LlmMessage],
        config: &'a LlmConfig,
        stream: bool,
    ) -> ChatRequest<'a> {
        ChatRequest {
            model: &config.model,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            stream,
        }
    }
}

fn classify_status(status: StatusCode, body: String) -> ProviderError {
    match status.as_u16() {
        401 => ProviderError::auth(PROVIDER),
        429 => ProviderError::rate_limit(PROVIDER),
        code => ProviderError::api(PROVIDER, format!("HTTP {}: {}", code, body)),
    }
}

/// Apply one SSE `data:` payload: track usage totals, hand back any text
/// delta. Malformed frames are skipped and the stream continues.
fn parse_stream_data(data: &str, tokens_used: &mut u32) -> Option<String> {
    let value: Value = serde_json::from_str(data).ok()?;
    if let Some(total) = value.pointer("/usage/total_tokens").and_then(Value::as_u64) {
        *tokens_used = total as u32;
    }
    let content = value.pointer("/choices/0/delta/content")?.as_str()?;
    if content.is_empty() {
        return None;
    }
    Some(content.to_string())
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn stream(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<ChunkStream, ProviderError> {
        let payload = Self::build_payload(messages, config, true);
        let response = self
            .http
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(&payload)
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

            'read: while let Some(item) = body.next().await {
                let Ok(bytes) = item else {
                    break; // abrupt end still finalizes below
                };
                for line in lines.push(&bytes) {
                    let Some(data) = sse::data_payload(&line) else {
                        continue;
                    };
                    if data == "[DONE]" {
                        break 'read;
                    }
                    if let Some(text) = parse_stream_data(data, &mut tokens_used) {
                        if tx.send(LlmChunk::text(text)).await.is_err() {
                            return; // consumer went away
                        }
                    }
                }
            }

            tracing::debug!("openai stream complete, model={}, tokens={}", model, tokens_used);
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
            .http
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(&payload)
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
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::api(PROVIDER, "response missing message content"))?;
        let tokens_used = value
            .pointer("/usage/total_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;

        Ok(LlmResponse {
            content: content.to_string(),
            tokens_used,
            model: config.model.clone(),
        })
    }

    fn validate_api_key(&self, api_key: &str) -> bool {
        api_key.starts_with("sk-") && api_key.len() > 20
    }
}
