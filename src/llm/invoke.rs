use super::{ChatRequest, ContentPart, ModelClient};
use crate::config::RetrySettings;
use crate::images::to_image_url;
use crate::models::ImageGroup;
use crate::prompt::group_separator;
use crate::retry::{RetryOutcome, with_retry};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

const OUTPUT_TOKENS_PER_UNIT: u32 = 800;
const OUTPUT_TOKENS_PER_UNIT_RESOLVING: u32 = 1000;

/// One model call's worth of input: the final prompt and the groups it covers.
#[derive(Debug, Clone, Copy)]
pub struct UnitRequest<'a> {
    pub prompt: &'a str,
    pub groups: &'a [ImageGroup],
    pub batched: bool,
    pub resolve_fields: bool,
}

impl UnitRequest<'_> {
    pub fn expected_outputs(&self) -> usize {
        if self.batched { self.groups.len() } else { 1 }
    }

    pub fn image_count(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    pub fn to_chat_request(&self) -> ChatRequest {
        let mut parts = Vec::with_capacity(1 + self.image_count() + self.groups.len());
        parts.push(ContentPart::text(self.prompt));
        for (idx, group) in self.groups.iter().enumerate() {
            if self.batched {
                parts.push(ContentPart::text(group_separator(idx)));
            }
            parts.extend(
                group
                    .iter()
                    .map(|reference| ContentPart::low_detail_image(to_image_url(reference))),
            );
        }

        let per_unit = if self.resolve_fields {
            OUTPUT_TOKENS_PER_UNIT_RESOLVING
        } else {
            OUTPUT_TOKENS_PER_UNIT
        };
        ChatRequest {
            parts,
            max_tokens: per_unit * self.expected_outputs().max(1) as u32,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("model call failed after {attempts} attempts: {last_error}")]
pub struct InvokeFailure {
    pub attempts: u32,
    pub last_error: String,
}

/// Calls the model with bounded retries. Budget admission happens before this.
#[derive(Clone)]
pub struct ModelInvoker {
    client: Arc<dyn ModelClient>,
    api_key: String,
    retry: RetrySettings,
}

impl ModelInvoker {
    pub fn new(client: Arc<dyn ModelClient>, api_key: String, retry: RetrySettings) -> Self {
        Self {
            client,
            api_key,
            retry,
        }
    }

    pub async fn invoke(&self, unit: &UnitRequest<'_>) -> Result<String, InvokeFailure> {
        let request = unit.to_chat_request();
        let label = if unit.batched { "batch" } else { "single" };
        let outcome = with_retry(&self.retry, label, |attempt| {
            debug!(
                target = "listing.llm",
                attempt,
                total = self.retry.max_retries + 1,
                parts = request.parts.len(),
                max_tokens = request.max_tokens,
                "model_call"
            );
            self.client.complete(&self.api_key, &request)
        })
        .await;

        match outcome {
            RetryOutcome::Success { value, .. } => Ok(value),
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => Err(InvokeFailure {
                attempts,
                last_error,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::time::Duration;

    struct ScriptedModel {
        replies: Mutex<Vec<Result<String, LlmError>>>,
        seen_keys: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn new(mut replies: Vec<Result<String, LlmError>>) -> Self {
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                seen_keys: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn complete(&self, api_key: &str, _request: &ChatRequest) -> Result<String, LlmError> {
            self.seen_keys.lock().unwrap().push(api_key.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(LlmError::Http("script exhausted".into())))
        }
    }

    fn groups() -> Vec<ImageGroup> {
        vec![
            vec!["a1".into(), "a2".into()],
            vec!["https://img.test/b1.jpg".into()],
        ]
    }

    #[test]
    fn batch_request_interleaves_separators() {
        let groups = groups();
        let unit = UnitRequest {
            prompt: "Describe.",
            groups: &groups,
            batched: true,
            resolve_fields: true,
        };
        let request = unit.to_chat_request();
        assert_eq!(request.max_tokens, 2000);
        assert_eq!(request.parts.len(), 6);
        assert_eq!(request.parts[0], ContentPart::text("Describe."));
        assert_eq!(request.parts[1], ContentPart::text("\n--- PRODUCT GROUP 1 ---"));
        assert_eq!(
            request.parts[2],
            ContentPart::low_detail_image("data:image/jpeg;base64,a1")
        );
        assert_eq!(request.parts[4], ContentPart::text("\n--- PRODUCT GROUP 2 ---"));
        assert_eq!(
            request.parts[5],
            ContentPart::low_detail_image("https://img.test/b1.jpg")
        );
    }

    #[test]
    fn single_request_has_no_separators() {
        let groups = vec![groups().remove(0)];
        let unit = UnitRequest {
            prompt: "Describe.",
            groups: &groups,
            batched: false,
            resolve_fields: false,
        };
        let request = unit.to_chat_request();
        assert_eq!(request.max_tokens, 800);
        assert_eq!(request.parts.len(), 3);
        assert!(
            request
                .parts
                .iter()
                .skip(1)
                .all(|part| matches!(part, ContentPart::ImageUrl { .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_rate_limits_then_succeeds() {
        let model = Arc::new(ScriptedModel::new(vec![
            Err(LlmError::Api {
                status: 429,
                code: Some("rate_limit_exceeded".into()),
                message: "slow down".into(),
            }),
            Ok("{\"title\":\"T\"}".into()),
        ]));
        let invoker = ModelInvoker::new(
            model.clone(),
            "sk-test".into(),
            RetrySettings {
                max_retries: 3,
                base_delay: Duration::from_millis(10),
            },
        );
        let groups = groups();
        let unit = UnitRequest {
            prompt: "p",
            groups: &groups[..1],
            batched: false,
            resolve_fields: false,
        };
        assert_eq!(invoker.invoke(&unit).await.unwrap(), "{\"title\":\"T\"}");
        assert_eq!(*model.seen_keys.lock().unwrap(), vec!["sk-test", "sk-test"]);
    }

    #[tokio::test(start_paused = true)]
    async fn surfaces_last_error_after_exhaustion() {
        let model = Arc::new(ScriptedModel::new(vec![
            Err(LlmError::Http("first".into())),
            Err(LlmError::Http("second".into())),
        ]));
        let invoker = ModelInvoker::new(
            model,
            "sk-test".into(),
            RetrySettings {
                max_retries: 1,
                base_delay: Duration::from_millis(10),
            },
        );
        let groups = groups();
        let unit = UnitRequest {
            prompt: "p",
            groups: &groups[..1],
            batched: false,
            resolve_fields: false,
        };
        let failure = invoker.invoke(&unit).await.unwrap_err();
        assert_eq!(failure.attempts, 2);
        assert_eq!(failure.last_error, "http error: second");
    }
}
