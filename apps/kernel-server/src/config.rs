// [[AXON]]/apps/kernel-server/src/config.rs
// Purpose: Process configuration, read once from the environment at boot.
// Architecture: Application Boot
// Dependencies: std

use std::collections::HashMap;
use std::env;

/// Everything the kernel reads from the environment. Parsed once in main
/// and shared read-only from then on.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    /// Backs both the event bus and run checkpointing. When unset the
    /// server runs with in-process state only.
    pub redis_url: Option<String>,
    pub debug: bool,
    /// Reserved for credential encryption at rest; surfaced so deployments
    /// can set it before that layer exists.
    pub encryption_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub groq_api_key: Option<String>,
    pub openrouter_api_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            port: 3000,
            redis_url: None,
            debug: false,
            encryption_key: None,
            openai_api_key: None,
            anthropic_api_key: None,
            gemini_api_key: None,
            groq_api_key: None,
            openrouter_api_key: None,
        }
    }
}

fn non_empty(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.is_empty())
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Settings {
            port: non_empty("KERNEL_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            redis_url: non_empty("REDIS_URL"),
            debug: non_empty("AXON_DEBUG")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            encryption_key: non_empty("ENCRYPTION_KEY"),
            openai_api_key: non_empty("OPENAI_API_KEY"),
            anthropic_api_key: non_empty("ANTHROPIC_API_KEY"),
            gemini_api_key: non_empty("GEMINI_API_KEY"),
            groq_api_key: non_empty("GROQ_API_KEY"),
            openrouter_api_key: non_empty("OPENROUTER_API_KEY"),
        }
    }

    /// Provider credentials configured through the environment. These are
    /// fallbacks only: a run request that names a provider always wins.
    pub fn env_api_keys(&self) -> HashMap<String, String> {
        let mut keys = HashMap::new();
        let pairs = [
            ("openai", &self.openai_api_key),
            ("anthropic", &self.anthropic_api_key),
            ("gemini", &self.gemini_api_key),
            ("groq", &self.groq_api_key),
            ("openrouter", &self.openrouter_api_key),
        ];
        for (name, key) in pairs {
            if let Some(key) = key {
                keys.insert(name.to_string(), key.clone());
            }
        }
        keys
    }

    /// One-line boot summary with secrets redacted down to presence.
    pub fn summary(&self) -> String {
        format!(
            "port={} redis={} debug={} encryption_key={} env_keys=[{}]",
            self.port,
            if self.redis_url.is_some() { "configured" } else { "disabled" },
            self.debug,
            if self.encryption_key.is_some() { "set" } else { "unset" },
            {
                let mut names: Vec<&str> = Vec::new();
                let map = self.env_api_keys();
                let mut sorted: Vec<&String> = map.keys().collect();
                sorted.sort();
                for name in sorted {
                    names.push(name.as_str());
                }
                names.join(",")
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_api_keys_only_includes_configured_providers() {
        let settings = Settings {
            openai_api_key: Some("sk-env".into()),
            gemini_api_key: Some("AIenv".into()),
            ..Settings::default()
        };
        let keys = settings.env_api_keys();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys["openai"], "sk-env");
        assert_eq!(keys["gemini"], "AIenv");
        assert!(!keys.contains_key("anthropic"));
    }

    #[test]
    fn summary_never_leaks_key_material() {
        let settings = Settings {
            openai_api_key: Some("sk-secret-value".into()),
            encryption_key: Some("fernet-secret".into()),
            ..Settings::default()
        };
        let summary = settings.summary();
        assert!(summary.contains("openai"));
        assert!(!summary.contains("secret"));
    }
}
