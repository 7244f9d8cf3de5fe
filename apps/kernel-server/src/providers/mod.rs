// [[AXON]]/apps/kernel-server/src/providers/mod.rs
// Purpose: Provider abstraction. One streaming contract over five vendor APIs.
// Architecture: Provider Interface Layer
// Dependencies: async-trait, reqwest, thiserror, tokio

pub mod anthropic;
pub mod gemini;
pub mod groq;
pub mod openai;
pub mod openrouter;
pub mod registry;
pub mod sse;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Total wall-clock budget for any single provider HTTP call,
/// streaming reads included.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub(crate) const CHUNK_BUFFER: usize = 64;

// === VALUE TYPES ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone)]
pub struct LlmMessage {
    pub role: Role,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        LlmMessage {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        LlmMessage {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        LlmMessage {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Per-call sampling parameters, set per-agent on the canvas.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// One fragment of streamed output. Exactly one final chunk terminates
/// every stream and carries the cumulative token count (0 if the vendor
/// never reported usage).
#[derive(Debug, Clone, PartialEq)]
pub struct LlmChunk {
    pub content: String,
    pub is_final: bool,
    pub tokens_used: u32,
}

impl LlmChunk {
    pub fn text(content: impl Into<String>) -> Self {
        LlmChunk {
            content: content.into(),
            is_final: false,
            tokens_used: 0,
        }
    }

    pub fn last(tokens_used: u32) -> Self {
        LlmChunk {
            content: String::new(),
            is_final: true,
            tokens_used,
        }
    }
}

/// Complete non-streaming response.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub tokens_used: u32,
    pub model: String,
}

// === ERRORS ===

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider '{provider}': invalid or missing API key")]
    Auth { provider: String },
    #[error("provider '{provider}': rate limit exceeded")]
    RateLimit { provider: String },
    #[error("provider '{provider}': {message}")]
    Api { provider: String, message: String },
}

impl ProviderError {
    pub fn auth(provider: impl Into<String>) -> Self {
        ProviderError::Auth {
            provider: provider.into(),
        }
    }

    pub fn rate_limit(provider: impl Into<String>) -> Self {
        ProviderError::RateLimit {
            provider: provider.into(),
        }
    }

    pub fn api(provider: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::Api {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

/// One-shot, ordered sequence of chunks from a single streaming call.
pub type ChunkStream = mpsc::Receiver<LlmChunk>;

// === PROVIDER CONTRACT ===

/// The capability set every adapter implements. Adapters are
/// single-use-per-call values handed out by the registry; provider
/// differences live entirely inside each implementation.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stream a response. Yields zero or more text chunks followed by
    /// exactly one final chunk — emitted even if the HTTP stream ends
    /// abruptly, with whatever token count was last known.
    async fn stream(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<ChunkStream, ProviderError>;

    /// Complete non-streaming call.
    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, ProviderError>;

    /// Cheap syntactic key check (prefix + length). No network call.
    fn validate_api_key(&self, api_key: &str) -> bool;
}

// === SHARED HTTP PLUMBING ===

pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .expect("failed to build HTTP client")
}

pub(crate) fn request_error(provider: &str, err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::api(provider, format!("request timed out: {}", err))
    } else {
        ProviderError::api(provider, format!("request failed: {}", err))
    }
}
