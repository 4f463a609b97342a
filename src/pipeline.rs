use crate::budget::TokenBudget;
use crate::config::{AppConfig, BatchConfig, RetrySettings};
use crate::credentials::CredentialProvider;
use crate::dispatch::{DispatchInput, Dispatcher};
use crate::llm::{ModelClient, ModelInvoker};
use crate::models::{InvocationEvent, InvocationResponse, ListingRecord, ListingRequest};
use crate::prompt::compose_field_resolution;
use crate::prompt_store::{PromptLookupError, PromptStore};
use serde_json::Value;
use std::{borrow::Cow, future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::{Instant, timeout};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

pub const MISSING_CATEGORY: &str = "Missing category or subcategory";
pub const CREDENTIALS_UNAVAILABLE: &str = "Failed to retrieve API credentials";
pub const INVOCATION_TIMED_OUT: &str = "Invocation timed out";

/// Knobs the pipeline reads from [`AppConfig`].
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub batch: BatchConfig,
    pub retry: RetrySettings,
    pub tokens_per_minute: u64,
    pub invocation_timeout: Option<Duration>,
}

impl From<&AppConfig> for PipelineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            batch: config.batch,
            retry: config.retry,
            tokens_per_minute: config.tokens_per_minute,
            invocation_timeout: config.invocation_timeout,
        }
    }
}

/// Validates an invocation, loads its prompt and credentials, and dispatches the
/// image groups to the model.
#[derive(Clone)]
pub struct Pipeline {
    settings: PipelineSettings,
    model: Arc<dyn ModelClient>,
    prompts: Arc<dyn PromptStore>,
    credentials: Arc<CredentialProvider>,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        model: Arc<dyn ModelClient>,
        prompts: Arc<dyn PromptStore>,
        credentials: Arc<CredentialProvider>,
    ) -> Self {
        Self {
            settings,
            model,
            prompts,
            credentials,
        }
    }

    /// Always produces an envelope; failures are mapped to their status and body.
    pub async fn run(&self, event: InvocationEvent) -> InvocationResponse {
        let request_id = Uuid::new_v4();
        let span = info_span!("invocation", request_id = %request_id);
        let started = Instant::now();

        let outcome = async {
            match self.settings.invocation_timeout {
                Some(limit) => timeout(limit, self.execute(event))
                    .await
                    .unwrap_or_else(|_| Err(PipelineError::timeout(limit))),
                None => self.execute(event).await,
            }
        }
        .instrument(span)
        .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(records) => {
                let failed = records.iter().filter(|r| r.is_error()).count();
                info!(
                    target = "listing.pipeline",
                    %request_id,
                    records = records.len(),
                    failed,
                    elapsed_ms,
                    "invocation_completed"
                );
                InvocationResponse::ok(&records)
            }
            Err(err) => {
                warn!(
                    target = "listing.pipeline",
                    %request_id,
                    stage = err.stage(),
                    error = %err,
                    elapsed_ms,
                    "invocation_failed"
                );
                err.to_response()
            }
        }
    }

    async fn execute(&self, event: InvocationEvent) -> Result<Vec<ListingRecord>, PipelineError> {
        let request = ListingRequest::from_event(event)
            .ok_or_else(|| PipelineError::invalid_input("validate", MISSING_CATEGORY))?;
        info!(
            target = "listing.pipeline",
            category = %request.category,
            sub_category = %request.sub_category,
            groups = request.image_groups.len(),
            resolve_fields = request.resolve_fields,
            category_fields = request.category_fields.len(),
            "invocation_started"
        );

        let base_prompt = self
            .capture_stage("load_prompt", async {
                self.prompts
                    .get_prompt(&request.category, &request.sub_category)
                    .await
                    .map_err(PipelineError::from)
            })
            .await?;

        let api_key = self
            .capture_stage("credentials", async {
                self.credentials.api_key().await.map_err(|err| {
                    warn!(target = "listing.pipeline", error = %err, "credentials_unavailable");
                    PipelineError::credentials()
                })
            })
            .await?;

        let prompt = compose_prompt(&request, &base_prompt);
        let invoker = ModelInvoker::new(self.model.clone(), api_key, self.settings.retry);
        let budget = TokenBudget::new(self.settings.tokens_per_minute);
        let dispatcher = Dispatcher::new(&invoker, &budget, self.settings.batch);

        self.capture_stage("dispatch", async {
            Ok(dispatcher
                .dispatch(DispatchInput {
                    prompt: &prompt,
                    options: &request.options,
                    groups: &request.image_groups,
                    resolve_fields: request.resolve_fields,
                })
                .await)
        })
        .await
    }

    async fn capture_stage<T, Fut>(&self, name: &'static str, fut: Fut) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        debug!(
            target = "listing.pipeline",
            stage = name,
            elapsed_ms = elapsed_ms as u64,
            ok = outcome.is_ok(),
            "stage_finished"
        );
        outcome
    }
}

/// Field-resolution instructions are only added when resolution was asked for and
/// the caller described the category's fields.
fn compose_prompt<'a>(request: &ListingRequest, base: &'a str) -> Cow<'a, str> {
    if request.resolve_fields && !request.category_fields.is_empty() {
        compose_field_resolution(base, &request.category_fields, &request.provided_values())
    } else {
        Cow::Borrowed(base)
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
    payload: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineErrorKind {
    InvalidInput,
    Upstream(u16),
    Credentials,
    Timeout,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
            payload: None,
        }
    }

    fn credentials() -> Self {
        Self {
            stage: "credentials",
            message: CREDENTIALS_UNAVAILABLE.into(),
            kind: PipelineErrorKind::Credentials,
            payload: None,
        }
    }

    fn timeout(limit: Duration) -> Self {
        Self {
            stage: "invocation",
            message: format!("no result within {}s", limit.as_secs_f64()),
            kind: PipelineErrorKind::Timeout,
            payload: None,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn status(&self) -> u16 {
        match self.kind {
            PipelineErrorKind::InvalidInput => 400,
            PipelineErrorKind::Upstream(status) => status,
            PipelineErrorKind::Credentials => 500,
            PipelineErrorKind::Timeout => 504,
        }
    }

    pub fn to_response(&self) -> InvocationResponse {
        match (&self.kind, &self.payload) {
            (PipelineErrorKind::Upstream(status), Some(payload)) => {
                InvocationResponse::error(*status, payload)
            }
            (PipelineErrorKind::Timeout, _) => {
                InvocationResponse::message(self.status(), INVOCATION_TIMED_OUT)
            }
            _ => InvocationResponse::message(self.status(), &self.message),
        }
    }
}

impl From<PromptLookupError> for PipelineError {
    fn from(err: PromptLookupError) -> Self {
        let message = err
            .payload
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("prompt lookup failed")
            .to_string();
        Self {
            stage: "load_prompt",
            message,
            kind: PipelineErrorKind::Upstream(err.status),
            payload: Some(err.payload),
        }
    }
}
