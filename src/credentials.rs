use crate::config::CredentialConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const KEY_FIELDS: [&str; 3] = ["apiKey", "api_key", "OPENAI_API_KEY"];

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("secret lookup failed: {0}")]
    Lookup(String),
    #[error("secret `{0}` does not contain an api key")]
    Malformed(String),
    #[error("no secret source configured")]
    Unconfigured,
}

/// Where the model API key lives at rest.
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Raw secret payload: either the key itself or a JSON object holding it.
    async fn fetch_secret(&self, name: &str) -> Result<String, CredentialError>;
}

struct CachedKey {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Hands out the model API key, caching a fetched key for the configured TTL and
/// falling back to the static key when the source fails.
pub struct CredentialProvider {
    source: Option<Arc<dyn SecretSource>>,
    config: CredentialConfig,
    cache: Mutex<Option<CachedKey>>,
}

impl CredentialProvider {
    pub fn new(source: Option<Arc<dyn SecretSource>>, config: CredentialConfig) -> Self {
        Self {
            source,
            config,
            cache: Mutex::new(None),
        }
    }

    pub async fn api_key(&self) -> Result<String, CredentialError> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref()
            && Utc::now() < cached.expires_at
        {
            debug!(target = "listing.credentials", "api_key_cache_hit");
            return Ok(cached.value.clone());
        }

        match self.fetch().await {
            Ok(value) => {
                let ttl = chrono::Duration::from_std(self.config.cache_ttl)
                    .unwrap_or_else(|_| chrono::Duration::minutes(5));
                *cache = Some(CachedKey {
                    value: value.clone(),
                    expires_at: Utc::now() + ttl,
                });
                info!(
                    target = "listing.credentials",
                    secret = %self.config.secret_name,
                    "api_key_refreshed"
                );
                Ok(value)
            }
            Err(err) => match &self.config.fallback_key {
                Some(fallback) => {
                    warn!(
                        target = "listing.credentials",
                        error = %err,
                        "api_key_fallback_to_env"
                    );
                    Ok(fallback.clone())
                }
                None => Err(err),
            },
        }
    }

    async fn fetch(&self) -> Result<String, CredentialError> {
        let source = self.source.as_ref().ok_or(CredentialError::Unconfigured)?;
        let raw = source.fetch_secret(&self.config.secret_name).await?;
        extract_api_key(&raw)
            .ok_or_else(|| CredentialError::Malformed(self.config.secret_name.clone()))
    }
}

/// Accepts `{"apiKey": ..}` style objects, a JSON string, or the bare key.
pub fn extract_api_key(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let key = match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(fields)) => KEY_FIELDS
            .iter()
            .find_map(|field| fields.get(*field).and_then(Value::as_str))
            .map(str::to_string),
        Ok(Value::String(key)) => Some(key),
        Ok(_) => None,
        Err(_) => Some(trimmed.to_string()),
    };
    key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty())
}
