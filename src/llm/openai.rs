use super::{ChatRequest, ContentPart, LlmError, ModelClient};
use crate::config::ModelConfig;
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// OpenAI-compatible chat-completions client.
pub struct OpenAiClient {
    http: Client,
    config: ModelConfig,
}

impl OpenAiClient {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn complete(&self, api_key: &str, request: &ChatRequest) -> Result<String, LlmError> {
        let body = CompletionRequest {
            model: &self.config.model,
            messages: [UserMessage {
                role: "user",
                content: &request.parts,
            }],
            max_tokens: request.max_tokens,
            temperature: self.config.temperature,
        };

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), &raw));
        }

        let payload: CompletionResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;

        payload
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| LlmError::InvalidResponse("missing message content".into()))
    }
}

fn api_error(status: u16, raw: &str) -> LlmError {
    match serde_json::from_str::<ErrorEnvelope>(raw) {
        Ok(envelope) => LlmError::Api {
            status,
            code: envelope.error.code.or(envelope.error.r#type),
            message: envelope.error.message,
        },
        Err(_) => LlmError::Api {
            status,
            code: None,
            message: raw.chars().take(300).collect(),
        },
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: [UserMessage<'a>; 1],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct UserMessage<'a> {
    role: &'static str,
    content: &'a [ContentPart],
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    r#type: Option<String>,
}
