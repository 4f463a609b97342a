use std::{env, path::PathBuf, time::Duration};

const DEFAULT_MODEL: &str = "gpt-4o-mini-2024-07-18";
const DEFAULT_MODEL_BASE_URL: &str = "https://api.openai.com/v1";

/// Everything the service reads from the environment, resolved once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub body_limit: usize,
    pub batch: BatchConfig,
    pub tokens_per_minute: u64,
    pub retry: RetrySettings,
    pub model: ModelConfig,
    pub credentials: CredentialConfig,
    pub prompts_file: Option<PathBuf>,
    pub invocation_timeout: Option<Duration>,
    pub json_logs: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT").unwrap_or(8000),
            body_limit: env_parse::<usize>("REQUEST_MAX_BYTES")
                .filter(|v| *v > 0)
                .unwrap_or(20 * 1024 * 1024),
            batch: BatchConfig::from_env(),
            tokens_per_minute: env_parse::<u64>("TOKENS_PER_MINUTE")
                .filter(|v| *v > 0)
                .unwrap_or(crate::budget::DEFAULT_TOKENS_PER_MINUTE),
            retry: RetrySettings::from_env(),
            model: ModelConfig::from_env(),
            credentials: CredentialConfig::from_env(),
            prompts_file: env::var("PROMPTS_FILE")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            invocation_timeout: env_parse::<u64>("INVOCATION_TIMEOUT_SECS")
                .filter(|v| *v > 0)
                .map(Duration::from_secs),
            json_logs: env::var("LOG_FORMAT")
                .map(|v| v.trim().eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub enabled: bool,
    pub size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            size: 1,
        }
    }
}

impl BatchConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: parse_env_bool("USE_BATCHING"),
            size: env_parse::<usize>("BATCH_SIZE")
                .filter(|v| *v >= 1)
                .unwrap_or(1),
        }
    }

    /// Whether `group_count` groups go to the model as one combined unit.
    pub fn combines(&self, group_count: usize) -> bool {
        self.enabled && group_count > 1 && group_count <= self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

const MAX_RETRIES_CEILING: u32 = 10;
const RETRY_BASE_MS_CEILING: u64 = 60_000;

impl RetrySettings {
    fn from_env() -> Self {
        Self::bounded(env_parse("MAX_RETRIES"), env_parse("RETRY_BASE_MS"))
    }

    /// Unset or zero base delays fall back to the default; both knobs are capped.
    fn bounded(max_retries: Option<u32>, base_ms: Option<u64>) -> Self {
        let defaults = Self::default();
        Self {
            max_retries: max_retries
                .unwrap_or(defaults.max_retries)
                .min(MAX_RETRIES_CEILING),
            base_delay: base_ms
                .filter(|v| *v > 0)
                .map(|v| Duration::from_millis(v.min(RETRY_BASE_MS_CEILING)))
                .unwrap_or(defaults.base_delay),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_MODEL_BASE_URL.into(),
            model: DEFAULT_MODEL.into(),
            temperature: 0.7,
        }
    }
}

impl ModelConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: env::var("MODEL_BASE_URL")
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.base_url),
            model: env::var("MODEL_NAME")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.model),
            temperature: env_parse::<f32>("MODEL_TEMPERATURE")
                .filter(|v| (0.0..=2.0).contains(v))
                .unwrap_or(defaults.temperature),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CredentialConfig {
    pub secret_name: String,
    pub fallback_key: Option<String>,
    pub cache_ttl: Duration,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            secret_name: "openai-api-key".into(),
            fallback_key: None,
            cache_ttl: Duration::from_secs(5 * 60),
        }
    }
}

impl CredentialConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            secret_name: env::var("OPENAI_SECRET_NAME")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.secret_name),
            fallback_key: env::var("OPENAI_API_KEY")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            cache_ttl: env_parse::<u64>("CREDENTIAL_CACHE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
        }
    }
}

pub fn parse_env_bool(key: &str) -> bool {
    env::var(key).map(|v| parse_bool(&v)).unwrap_or(false)
}

pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}
