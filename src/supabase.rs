use crate::credentials::{CredentialError, SecretSource};
use crate::http::build_client;
use crate::prompt_store::{PromptLookupError, PromptStore};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::{debug, warn};

const DEFAULT_PROMPT_TABLE: &str = "list_category";
const DEFAULT_SECRET_TABLE: &str = "app_secrets";

/// PostgREST client for the prompt and secret tables.
#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    prompt_table: String,
    secret_table: String,
    http: Client,
}

#[derive(Debug, Error)]
pub enum SupabaseError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

#[derive(Debug, Deserialize)]
struct PromptRow {
    #[serde(default)]
    prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SecretRow {
    secret: String,
}

impl SupabaseClient {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        let table = |key: &str, default: &str| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            prompt_table: table("PROMPT_TABLE", DEFAULT_PROMPT_TABLE),
            secret_table: table("SECRET_TABLE", DEFAULT_SECRET_TABLE),
            http: build_client(),
        })
    }

    fn table_url(&self, table: &str, filters: &[(&str, &str)], columns: &str) -> String {
        let query = filters
            .iter()
            .map(|(column, value)| format!("{column}=eq.{}", urlencoding::encode(value)))
            .collect::<Vec<_>>()
            .join("&");
        format!(
            "{}/rest/v1/{table}?{query}&select={columns}&limit=1",
            self.base_url
        )
    }

    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        filters: &[(&str, &str)],
        columns: &str,
    ) -> Result<Vec<T>, SupabaseError> {
        let response = self
            .http
            .get(self.table_url(table, filters, columns))
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SupabaseError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|err| SupabaseError::Deserialize(err.to_string()))
    }
}

#[async_trait]
impl PromptStore for SupabaseClient {
    async fn get_prompt(
        &self,
        category: &str,
        sub_category: &str,
    ) -> Result<String, PromptLookupError> {
        let rows: Vec<PromptRow> = self
            .select(
                &self.prompt_table,
                &[("category", category), ("sub_category", sub_category)],
                "prompt",
            )
            .await
            .map_err(|err| {
                warn!(
                    target = "listing.prompts",
                    category,
                    sub_category,
                    error = %err,
                    "prompt_lookup_failed"
                );
                PromptLookupError::failed(&err.to_string(), category, sub_category)
            })?;

        match rows.into_iter().next() {
            Some(row) => {
                let prompt = row.prompt.unwrap_or_default();
                debug!(
                    target = "listing.prompts",
                    category,
                    sub_category,
                    chars = prompt.len(),
                    "prompt_loaded"
                );
                Ok(prompt)
            }
            None => Err(PromptLookupError::not_found()),
        }
    }
}

#[async_trait]
impl SecretSource for SupabaseClient {
    async fn fetch_secret(&self, name: &str) -> Result<String, CredentialError> {
        let rows: Vec<SecretRow> = self
            .select(&self.secret_table, &[("name", name)], "secret")
            .await
            .map_err(|err| CredentialError::Lookup(err.to_string()))?;
        rows.into_iter()
            .next()
            .map(|row| row.secret)
            .ok_or_else(|| CredentialError::Lookup(format!("secret `{name}` not found")))
    }
}
