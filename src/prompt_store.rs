use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::{collections::HashMap, path::Path};
use thiserror::Error;

/// Lookup failure carrying the status and payload that go back to the caller.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("prompt lookup failed with status {status}")]
pub struct PromptLookupError {
    pub status: u16,
    pub payload: Value,
}

impl PromptLookupError {
    pub fn not_found() -> Self {
        Self {
            status: 404,
            payload: json!({"error": "Item not found", "statusCode": 404}),
        }
    }

    pub fn failed(message: &str, category: &str, sub_category: &str) -> Self {
        Self {
            status: 500,
            payload: json!({
                "error": message,
                "Category": category,
                "SubCategory": sub_category,
                "statusCode": 500
            }),
        }
    }
}

/// Base prompt templates keyed by (category, sub-category).
#[async_trait]
pub trait PromptStore: Send + Sync {
    async fn get_prompt(&self, category: &str, sub_category: &str)
    -> Result<String, PromptLookupError>;
}

#[derive(Debug, Deserialize)]
struct PromptEntry {
    category: String,
    sub_category: String,
    prompt: String,
}

#[derive(Debug, Error)]
pub enum PromptFileError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid prompt file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Prompts loaded once from a YAML list of `{category, sub_category, prompt}`.
#[derive(Debug, Default)]
pub struct YamlPromptStore {
    prompts: HashMap<(String, String), String>,
}

impl YamlPromptStore {
    pub fn from_yaml(raw: &str) -> Result<Self, PromptFileError> {
        let entries: Vec<PromptEntry> = serde_yaml::from_str(raw)?;
        let prompts = entries
            .into_iter()
            .map(|entry| ((entry.category, entry.sub_category), entry.prompt))
            .collect();
        Ok(Self { prompts })
    }

    pub fn from_file(path: &Path) -> Result<Self, PromptFileError> {
        let raw = std::fs::read_to_string(path).map_err(|source| PromptFileError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

#[async_trait]
impl PromptStore for YamlPromptStore {
    async fn get_prompt(
        &self,
        category: &str,
        sub_category: &str,
    ) -> Result<String, PromptLookupError> {
        self.prompts
            .get(&(category.to_string(), sub_category.to_string()))
            .cloned()
            .ok_or_else(PromptLookupError::not_found)
    }
}
