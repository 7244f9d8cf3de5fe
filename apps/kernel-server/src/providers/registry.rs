// [[AXON]]/apps/kernel-server/src/providers/registry.rs
// Purpose: Provider name -> adapter constructor map.
// Architecture: Provider Factory
// Dependencies: std

use crate::providers::anthropic::AnthropicProvider;
use crate::providers::gemini::GeminiProvider;
use crate::providers::groq::GroqProvider;
use crate::providers::openai::OpenAiProvider;
use crate::providers::openrouter::OpenRouterProvider;
use crate::providers::{LlmProvider, ProviderError};
use std::collections::HashMap;
use std::sync::Arc;

type ProviderFactory = Arc<dyn Fn(String, Option<String>) -> Arc<dyn LlmProvider> + Send + Sync>;

/// Adding a provider means one new adapter module and one `register`
/// call here; the engine, API, and frontend stay untouched.
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        ProviderRegistry {
            factories: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("openai", |key, base| Arc::new(OpenAiProvider::new(key, base)));
        registry.register("anthropic", |key, base| {
            Arc::new(AnthropicProvider::new(key, base))
        });
        registry.register("gemini", |key, base| Arc::new(GeminiProvider::new(key, base)));
        registry.register("groq", |key, base| Arc::new(GroqProvider::new(key, base)));
        registry.register("openrouter", |key, base| {
            Arc::new(OpenRouterProvider::new(key, base))
        });
        registry
    }

    pub fn register<F, P>(&mut self, name: &str, factory: F)
    where
        F: Fn(String, Option<String>) -> Arc<P> + Send + Sync + 'static,
        P: LlmProvider + 'static,
    {
        self.factories.insert(
            name.to_string(),
            Arc::new(move |key, base| factory(key, base) as Arc<dyn LlmProvider>),
        );
    }

    /// Instantiate an adapter. An empty key is an auth failure up front;
    /// an unknown name reports the supported set.
    pub fn get(
        &self,
        name: &str,
        api_key: &str,
        base_url: Option<String>,
    ) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        if api_key.is_empty() {
            return Err(ProviderError::auth(name));
        }
        let factory = self.factories.get(name).ok_or_else(|| {
            ProviderError::api(
                name,
                format!(
                    "unsupported provider; available: {}",
                    self.list_names().join(", ")
                ),
            )
        })?;
        Ok(factory(api_key.to_string(), base_url))
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ChunkStream, LlmConfig, LlmMessage, LlmResponse};
    use async_trait::async_trait;

    #[test]
    fn defaults_cover_all_five_vendors() {
        let registry = ProviderRegistry::with_defaults();
        assert_eq!(
            registry.list_names(),
            vec!["anthropic", "gemini", "groq", "openai", "openrouter"]
        );
    }

    #[test]
    fn empty_key_is_an_auth_error() {
        let registry = ProviderRegistry::with_defaults();
        match registry.get("openai", "", None) {
            Err(ProviderError::Auth { provider }) => assert_eq!(provider, "openai"),
            other => panic!("expected auth error, got {:?}", other.err()),
        }
    }

    #[test]
    fn unknown_provider_names_the_supported_set() {
        let registry = ProviderRegistry::with_defaults();
        match registry.get("replicate", "some-key", None) {
            Err(ProviderError::Api { message, .. }) => {
                assert!(message.contains("unsupported provider"));
                assert!(message.contains("openai"));
                assert!(message.contains("gemini"));
            }
            other => panic!("expected api error, got {:?}", other.err()),
        }
    }

    #[test]
    fn known_provider_resolves() {
        let registry = ProviderRegistry::with_defaults();
        let provider = registry.get("anthropic", "sk-ant-test", None).unwrap();
        assert!(provider.validate_api_key("sk-ant-abcdefghijklmnopqr"));
    }

    struct NullProvider;

    #[async_trait]
    impl crate::providers::LlmProvider for NullProvider {
        async fn stream(
            &self,
            _messages: &[LlmMessage],
            _config: &LlmConfig,
        ) -> Result<ChunkStream, ProviderError> {
            let (_, rx) = tokio::sync::mpsc::channel(1);
            Ok(rx)
        }

        async fn complete(
            &self,
            _messages: &[LlmMessage],
            _config: &LlmConfig,
        ) -> Result<LlmResponse, ProviderError> {
            Err(ProviderError::api("null", "not implemented"))
        }

        fn validate_api_key(&self, _api_key: &str) -> bool {
            true
        }
    }

    #[test]
    fn custom_providers_can_be_registered() {
        let mut registry = ProviderRegistry::empty();
        registry.register("null", |_key, _base| Arc::new(NullProvider));
        assert!(registry.get("null", "any-key", None).is_ok());
        assert_eq!(registry.list_names(), vec!["null"]);
    }
}
