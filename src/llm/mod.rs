mod invoke;
mod openai;

pub use invoke::{ModelInvoker, UnitRequest};
pub use openai::OpenAiClient;

use crate::retry::Throttled;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

const RATE_LIMIT_SIGNATURE: &str = "rate_limit_exceeded";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn low_detail_image(url: impl Into<String>) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: url.into(),
                detail: "low",
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageUrl {
    pub url: String,
    pub detail: &'static str,
}

/// One user turn of multimodal content plus the output ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub parts: Vec<ContentPart>,
    pub max_tokens: u32,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("http error: {0}")]
    Http(String),
    #[error("api error (HTTP {status}){}: {message}", code_suffix(.code))]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref().map(|c| format!(" [{c}]")).unwrap_or_default()
}

impl Throttled for LlmError {
    fn is_rate_limited(&self) -> bool {
        match self {
            LlmError::Api { status: 429, .. } => true,
            other => other.to_string().contains(RATE_LIMIT_SIGNATURE),
        }
    }
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Sends one chat request and returns the assistant text.
    async fn complete(&self, api_key: &str, request: &ChatRequest) -> Result<String, LlmError>;
}
