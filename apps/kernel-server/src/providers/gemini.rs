// [[AXON]]/apps/kernel-server/src/providers/gemini.rs
// Purpose: Google Gemini adapter. Key-in-URL auth, parts-based payloads.
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

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const PROVIDER: &str = "gemini";

/// Google Gemini provider.
///
/// Odd one out on every axis: the model lives in the URL path, the key is
/// a query parameter (so the URL must never be logged), roles are
/// "user"/"model", and a bad key can come back as 403 as well as 401.
pub struct GeminiProvider {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
}

#[derive(Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct Part {
    text: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

impl GeminiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        GeminiProvider {
            api_key,
            base_url: base_url.unwrap_or_else(|| GEMINI_BASE_URL.to_string()),
            http: http_client(),
        }
    }

    fn build_url(&self, model: &str, stream: bool) -> String {
        let action = if stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        format!("{}/{}:{}?key={}", self.base_url, model, action, self.api_key)
    }

    /// System prompt moves to systemInstruction; assistant turns become
    /// "model" turns.
    fn build_payload(messages: &[LlmMessage], config: &LlmConfig) -> GenerateRequest {
        let mut system_instruction = None;
        let mut contents = Vec::new();
        for message in messages {
            match message.role {
                Role::System => {
                    system_instruction = Some(SystemInstruction {
                        parts: vec![Part {
                            text: message.content.clone(),
                        }],
                    });
                }
                Role::Assistant => contents.push(Content {
                    role: "model",
                    parts: vec![Part {
                        text: message.content.clone(),
                    }],
                }),
                Role::User => contents.push(Content {
                    role: "user",
                    parts: vec![Part {
                        text: message.content.clone(),
                    }],
                }),
            }
        }
        GenerateRequest {
            contents,
            generation_config: GenerationConfig {
                temperature: config.temperature,
                max_output_tokens: config.max_tokens,
            },
            system_instruction,
        }
    }
}

fn classify_status(status: StatusCode, body: String) -> ProviderError {
    match status.as_u16() {
        // Google reports bad keys as 403 about as often as 401.
        401 | 403 => ProviderError::auth(PROVIDER),
        429 => ProviderError::rate_limit(PROVIDER),
        code => ProviderError::api(PROVIDER, format!("HTTP {}: {}", code, body)),
    }
}

/// One streamed frame can carry several text parts; token totals are
/// cumulative per frame, so the last one seen wins.
fn parse_stream_data(data: &str, tokens_used: &mut u32) -> Vec<String> {
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        return Vec::new();
    };
    if let Some(total) = value
        .pointer("/usageMetadata/totalTokenCount")
        .and_then(Value::as_u64)
    {
        if total > 0 {
            *tokens_used = total as u32;
        }
    }
    let Some(parts) = value
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn stream(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<ChunkStream, ProviderError> {
        let url = format!("{}&alt=sse", self.build_url(&config.model, true));
        let payload = Self::build_payload(messages, config);
        let response = self
            .http
            .post(&url)
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
                    break;
                };
                for line in lines.push(&bytes) {
                    let Some(data) = sse::data_payload(&line) else {
                        continue;
                    };
                    for text in parse_stream_data(data, &mut tokens_used) {
                        if tx.send(LlmChunk::text(text)).await.is_err() {
                            break 'read;
                        }
                    }
                }
            }

            tracing::debug!("gemini stream complete, model={}, tokens={}", model, tokens_used);
            let _ = tx.send(LlmChunk::last(tokens_used)).await;
        });

        Ok(rx)
    }

    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, ProviderError> {
        let url = self.build_url(&config.model, false);
        let payload = Self::build_payload(messages, config);
        let response = self
            .http
            .post(&url)
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
        let content: String = value
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default();
        let tokens_used = value
            .pointer("/usageMetadata/totalTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;

        Ok(LlmResponse {
            content,
            tokens_used,
            model: config.model.clone(),
        })
    }

    fn validate_api_key(&self, api_key: &str) -> bool {
        api_key.starts_with("AI") && api_key.len() > 20
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LlmConfig {
        LlmConfig {
            model: "gemini-2.0-flash".into(),
            temperature: 0.5,
            max_tokens: 1024,
        }
    }

    #[test]
    fn url_places_model_action_and_key() {
        let p = GeminiProvider::new("AIzaTestKey".into(), None);
        assert_eq!(
            p.build_url("gemini-2.0-flash", false),
            format!(
                "{}/gemini-2.0-flash:generateContent?key=AIzaTestKey",
                GEMINI_BASE_URL
            )
        );
        assert!(p
            .build_url("gemini-2.0-flash", true)
            .contains(":streamGenerateContent?key="));
    }

    #[test]
    fn payload_maps_roles_and_lifts_the_system_prompt() {
        let messages = vec![
            LlmMessage::system("stay factual"),
            LlmMessage::user("question"),
            LlmMessage::assistant("answer"),
        ];
        let value =
            serde_json::to_value(GeminiProvider::build_payload(&messages, &config())).unwrap();
        assert_eq!(
            value["systemInstruction"]["parts"][0]["text"],
            "stay factual"
        );
        let contents = value["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(value["generationConfig"]["maxOutputTokens"], 1024);
    }

    #[test]
    fn frames_may_carry_multiple_parts() {
        let mut tokens = 0;
        let texts = parse_stream_data(
            r#"{"candidates":[{"content":{"parts":[{"text":"a"},{"text":"b"}]}}],"usageMetadata":{"totalTokenCount":10}}"#,
            &mut tokens,
        );
        assert_eq!(texts, vec!["a", "b"]);
        assert_eq!(tokens, 10);
    }

    #[test]
    fn token_totals_are_last_write_wins() {
        let mut tokens = 0;
        parse_stream_data(r#"{"usageMetadata":{"totalTokenCount":4}}"#, &mut tokens);
        parse_stream_data(r#"{"usageMetadata":{"totalTokenCount":9}}"#, &mut tokens);
        // A frame without usage leaves the total untouched.
        parse_stream_data(r#"{"candidates":[]}"#, &mut tokens);
        assert_eq!(tokens, 9);
    }

    #[test]
    fn key_format_check() {
        let p = GeminiProvider::new("k".into(), None);
        assert!(p.validate_api_key("AIzaSyAbCdEfGhIjKlMnOpQr"));
        assert!(!p.validate_api_key("sk-abcdefghijklmnopqrstu"));
        assert!(!p.validate_api_key("AIshort"));
    }
}
