use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{ResearchError, SecretValue, require_env};

const DEFAULT_CONFIG_PATH: &str = "config.toml";
const CONFIG_PATH_ENV: &str = "RESEARCH_CONFIG";

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub search: SearchConfig,
    pub research: LoopConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Resolve the language-model API key (from environment only).
    pub fn llm_api_key(&self) -> Result<SecretValue, ResearchError> {
        require_env(&self.llm.api_key_env)
    }

    /// Resolve the search-service API key (from environment only).
    pub fn search_api_key(&self) -> Result<SecretValue, ResearchError> {
        require_env(&self.search.api_key_env)
    }
}

/// Helper to load configuration with guard rails.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `RESEARCH_CONFIG` environment variable.
    /// 3. `config.toml` in the current working directory.
    ///
    /// Only the implicit `config.toml` may be absent, in which case the
    /// built-in defaults apply.
    pub fn load(path: Option<PathBuf>) -> Result<Config, ResearchError> {
        let (candidate, explicit) = resolve_path(path);
        if !explicit && !candidate.exists() {
            let config = Config::default();
            Self::validate(&config)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&candidate)
            .map_err(|err| ResearchError::config_io(candidate.clone(), err))?;
        Self::parse(&raw)
    }

    /// Parse and validate configuration from TOML text.
    pub fn parse(raw: &str) -> Result<Config, ResearchError> {
        let config: Config = toml::from_str(raw)
            .map_err(|err| ResearchError::InvalidConfiguration(err.to_string()))?;
        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &Config) -> Result<(), ResearchError> {
        let invalid = |msg: &str| Err(ResearchError::InvalidConfiguration(msg.to_string()));

        if config.llm.api_key_env.trim().is_empty() {
            return invalid("llm.api_key_env must reference an environment variable");
        }
        if config.search.api_key_env.trim().is_empty() {
            return invalid("search.api_key_env must reference an environment variable");
        }
        if config.research.max_iterations == 0 {
            return invalid("research.max_iterations must be at least 1");
        }
        if !(1..=20).contains(&config.search.max_results_per_query) {
            return invalid("search.max_results_per_query must be between 1 and 20");
        }
        if config.rate_limit.capacity == 0 {
            return invalid("rate_limit.capacity must be positive");
        }
        let refill = config.rate_limit.refill_per_second;
        if !(refill.is_finite() && refill > 0.0) {
            return invalid("rate_limit.refill_per_second must be positive");
        }
        if !(config.rate_limit.chars_per_token > 0.0) {
            return invalid("rate_limit.chars_per_token must be positive");
        }
        Ok(())
    }
}

fn resolve_path(path: Option<PathBuf>) -> (PathBuf, bool) {
    if let Some(path) = path {
        return (path, true);
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return (PathBuf::from(from_env), true);
        }
    }

    (Path::new(DEFAULT_CONFIG_PATH).to_path_buf(), false)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub api_key_env: String,
    pub base_url: Option<String>,
    pub planner_max_tokens: u32,
    pub curation_max_tokens: u32,
    pub report_max_tokens: u32,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            model: "gemini-1.5-flash".to_string(),
            api_key_env: "GOOGLE_API_KEY".to_string(),
            base_url: None,
            planner_max_tokens: 4500,
            curation_max_tokens: 3500,
            report_max_tokens: 5000,
            temperature: 0.2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub api_key_env: String,
    pub base_url: Option<String>,
    pub max_results_per_query: u8,
    pub default_news_days: u32,
    pub request_timeout_secs: u64,
}

impl SearchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key_env: "TAVILY_API_KEY".to_string(),
            base_url: None,
            max_results_per_query: 10,
            default_news_days: 7,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub max_iterations: u32,
    pub max_curated_documents: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            max_curated_documents: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub capacity: u64,
    pub refill_per_second: f64,
    pub chars_per_token: f64,
    pub acquire_timeout_ms: Option<u64>,
}

impl RateLimitConfig {
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        // 6000 tokens per minute.
        Self {
            capacity: 6000,
            refill_per_second: 100.0,
            chars_per_token: 3.5,
            acquire_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
