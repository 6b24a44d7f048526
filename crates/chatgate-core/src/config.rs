//! Layered gateway configuration: built-in defaults, then an optional TOML
//! file named by `CHATGATE_CONFIG`, then `CHATGATE__SECTION__KEY` env vars.

use crate::types::GenerationOptions;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/chatgate";

/// Saved in place of an assistant reply when a provider produced nothing.
pub const DEFAULT_PLACEHOLDER_REPLY: &str =
    "Sorry, I could not produce an answer this time. Please try again.";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub prompts: PromptConfig,
    pub routing: RoutingConfig,
    pub general: GeneralProviderConfig,
    pub research: ResearchProviderConfig,
    pub data: DataProviderConfig,
    pub retrieval: RetrievalConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".into(), port: 8000 }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub base_system_prompt: String,
    pub global_prompts: Vec<String>,
    pub placeholder_reply: String,
    pub default_options: GenerationOptions,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            base_system_prompt: "You are a helpful assistant. Answer accurately and concisely, \
                and say so when you do not know."
                .into(),
            global_prompts: Vec::new(),
            placeholder_reply: DEFAULT_PLACEHOLDER_REPLY.into(),
            default_options: GenerationOptions {
                temperature: Some(0.8),
                top_p: Some(0.8),
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub auto_route: bool,
    pub research_enabled: bool,
    pub data_enabled: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self { auto_route: true, research_enabled: true, data_enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralProviderConfig {
    /// Full chat-completions URL.
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for GeneralProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions".into(),
            api_key: String::new(),
            model: "qwen-plus".into(),
            timeout_secs: 120,
        }
    }
}

impl GeneralProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResearchProviderConfig {
    /// http(s) base; the socket URL is derived from it.
    pub base_url: String,
    pub timeout_secs: u64,
    pub default_report_type: String,
    pub default_tone: String,
    pub poll_interval_ms: u64,
    pub heartbeat_secs: u64,
    pub grace_secs: u64,
    pub chunk_chars: usize,
    pub chunk_delay_ms: u64,
}

impl Default for ResearchProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".into(),
            timeout_secs: 600,
            default_report_type: "research_report".into(),
            default_tone: "Informative".into(),
            poll_interval_ms: 100,
            heartbeat_secs: 5,
            grace_secs: 2,
            chunk_chars: 20,
            chunk_delay_ms: 50,
        }
    }
}

impl ResearchProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// `http://host/x` becomes `ws://host/x/ws`, `https` becomes `wss`.
    pub fn socket_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws}/ws")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DataProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for DataProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8200".into(),
            api_key: "dummy".into(),
            model: "qwen-plus".into(),
            timeout_secs: 300,
        }
    }
}

impl DataProviderConfig {
    pub fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Semantic search endpoint; empty disables local search.
    pub local_endpoint: String,
    pub local_top_k: usize,
    pub local_min_similarity: f64,
    pub web_enabled: bool,
    pub web_endpoint: String,
    pub web_api_key: String,
    pub web_search_depth: String,
    pub web_top_n: usize,
    pub web_min_score: f64,
    pub web_cache_ttl_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            local_endpoint: String::new(),
            local_top_k: 8,
            local_min_similarity: 0.4,
            web_enabled: true,
            web_endpoint: "https://api.tavily.com/search".into(),
            web_api_key: String::new(),
            web_search_depth: "basic".into(),
            web_top_n: 6,
            web_min_score: 0.0,
            web_cache_ttl_secs: 30 * 60,
        }
    }
}

impl RetrievalConfig {
    pub fn web_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.web_cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub path: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { path: "./data/chat_history".into() }
    }
}

impl GatewayConfig {
    /// Load configuration: defaults, optional file named by `CHATGATE_CONFIG`
    /// (default `config/chatgate`, any extension the `config` crate knows),
    /// then `CHATGATE__...` environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("CHATGATE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let builder = config::Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8000_i64)?;

        let path = Path::new(&config_path);
        let builder = if path.exists() || path.with_extension("toml").exists() {
            builder.add_source(config::File::with_name(&config_path).required(false))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("CHATGATE").separator("__"))
            .build()?;

        let mut cfg: GatewayConfig = built.try_deserialize()?;
        cfg.apply_env_fallbacks();
        Ok(cfg)
    }

    /// Honor the plain, well-known variables when the structured keys are unset.
    fn apply_env_fallbacks(&mut self) {
        fill_from_env(&mut self.retrieval.web_api_key, "TAVILY_API_KEY");
        fill_from_env(&mut self.general.api_key, "GENERAL_LLM_API_KEY");
        if let Ok(prompt) = std::env::var("BASE_SYSTEM_PROMPT") {
            if !prompt.trim().is_empty() {
                self.prompts.base_system_prompt = prompt;
            }
        }
    }

    /// Base prompt + global prompts + per-request prompts, blanks dropped.
    pub fn build_system_prompt(&self, temporary: &[String]) -> String {
        std::iter::once(&self.prompts.base_system_prompt)
            .chain(self.prompts.global_prompts.iter())
            .chain(temporary.iter())
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn fill_from_env(slot: &mut String, var: &str) {
    if slot.trim().is_empty() {
        if let Ok(value) = std::env::var(var) {
            *slot = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_drops_blank_fragments() {
        let mut cfg = GatewayConfig::default();
        cfg.prompts.base_system_prompt = "base".into();
        cfg.prompts.global_prompts = vec!["  ".into(), "global".into()];
        let prompt = cfg.build_system_prompt(&["temp".into(), String::new()]);
        assert_eq!(prompt, "base\n\nglobal\n\ntemp");
    }

    #[test]
    fn socket_url_follows_scheme() {
        let mut research = ResearchProviderConfig::default();
        research.base_url = "https://research.example.com/".into();
        assert_eq!(research.socket_url(), "wss://research.example.com/ws");
        research.base_url = "http://localhost:8000".into();
        assert_eq!(research.socket_url(), "ws://localhost:8000/ws");
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.retrieval.local_top_k, 8);
        assert_eq!(cfg.retrieval.web_top_n, 6);
        assert_eq!(cfg.retrieval.web_cache_ttl(), Duration::from_secs(1800));
        assert_eq!(cfg.research.timeout(), Duration::from_secs(600));
        assert_eq!(cfg.prompts.default_options.temperature, Some(0.8));
        assert!(cfg.routing.auto_route);
    }
}
