use crate::budget::{Admission, TokenBudget, UnitShape, estimate_tokens};
use crate::config::BatchConfig;
use crate::llm::{ModelInvoker, UnitRequest};
use crate::models::{ImageGroup, ListingRecord};
use crate::normalize::{normalize_batch, normalize_single, reconcile};
use crate::prompt::{batch_instructions, with_option_context};
use serde_json::{Map, Value};
use std::slice;
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, info, warn};

pub const BATCH_FAILURE: &str = "Batch processing failed after max retries";
pub const MISSING_BATCH_RECORD: &str = "Missing result from batch processing";

/// Added on top of the budget's own wait so the window has rolled when we resume.
const BUDGET_MARGIN: Duration = Duration::from_millis(100);

/// Everything one invocation needs to turn image groups into records.
#[derive(Debug, Clone, Copy)]
pub struct DispatchInput<'a> {
    pub prompt: &'a str,
    pub options: &'a Map<String, Value>,
    pub groups: &'a [ImageGroup],
    pub resolve_fields: bool,
}

/// Runs work units strictly in input order, one model call at a time.
pub struct Dispatcher<'a> {
    invoker: &'a ModelInvoker,
    budget: &'a TokenBudget,
    batch: BatchConfig,
}

impl<'a> Dispatcher<'a> {
    pub fn new(invoker: &'a ModelInvoker, budget: &'a TokenBudget, batch: BatchConfig) -> Self {
        Self {
            invoker,
            budget,
            batch,
        }
    }

    /// One record per image group, in input order.
    pub async fn dispatch(&self, input: DispatchInput<'_>) -> Vec<ListingRecord> {
        let count = input.groups.len();
        if self.batch.combines(count) {
            info!(
                target = "listing.dispatch",
                groups = count,
                batch_size = self.batch.size,
                "dispatch_batch"
            );
            let records = self.run_batch(&input).await;
            return reconcile(records, count, MISSING_BATCH_RECORD);
        }

        info!(target = "listing.dispatch", groups = count, "dispatch_individual");
        let mut records = Vec::with_capacity(count);
        for (index, group) in input.groups.iter().enumerate() {
            debug!(target = "listing.dispatch", group = index + 1, total = count, "unit_start");
            records.push(self.run_single(&input, group).await);
        }
        records
    }

    async fn run_single(&self, input: &DispatchInput<'_>, group: &ImageGroup) -> ListingRecord {
        let prompt = with_option_context(input.prompt, input.options);
        let unit = UnitRequest {
            prompt: &prompt,
            groups: slice::from_ref(group),
            batched: false,
            resolve_fields: input.resolve_fields,
        };
        self.admit(input, &unit).await;

        let started = Instant::now();
        let record = match self.invoker.invoke(&unit).await {
            Ok(raw) => normalize_single(&raw, input.resolve_fields),
            Err(failure) => {
                warn!(
                    target = "listing.dispatch",
                    attempts = failure.attempts,
                    error = %failure.last_error,
                    "unit_failed"
                );
                ListingRecord::exhausted(
                    format!("Failed to process after {} attempts", failure.attempts),
                    &failure.last_error,
                )
            }
        };
        crate::metrics::unit_elapsed("single", 1, started.elapsed().as_millis());
        record
    }

    async fn run_batch(&self, input: &DispatchInput<'_>) -> Vec<ListingRecord> {
        let count = input.groups.len();
        let prompt = batch_instructions(
            &with_option_context(input.prompt, input.options),
            count,
            input.resolve_fields,
        );
        let unit = UnitRequest {
            prompt: &prompt,
            groups: input.groups,
            batched: true,
            resolve_fields: input.resolve_fields,
        };
        self.admit(input, &unit).await;

        let started = Instant::now();
        let records = match self.invoker.invoke(&unit).await {
            Ok(raw) => normalize_batch(&raw, count, input.resolve_fields),
            Err(failure) => {
                warn!(
                    target = "listing.dispatch",
                    attempts = failure.attempts,
                    groups = count,
                    error = %failure.last_error,
                    "batch_failed"
                );
                vec![ListingRecord::exhausted(BATCH_FAILURE, &failure.last_error); count]
            }
        };
        crate::metrics::unit_elapsed("batch", count, started.elapsed().as_millis());
        records
    }

    /// Waits out a budget denial once, then lets the call through regardless.
    ///
    /// The estimate uses the prompt before option context is appended; the options
    /// are counted separately.
    async fn admit(&self, input: &DispatchInput<'_>, unit: &UnitRequest<'_>) {
        let shape = UnitShape {
            group_count: unit.groups.len(),
            image_count: unit.image_count(),
            batched: unit.batched,
            resolve_fields: unit.resolve_fields,
        };
        let tokens = estimate_tokens(input.prompt, input.options, shape);
        if let Admission::Wait(wait) = self.budget.try_consume(tokens).await {
            let pause = wait + BUDGET_MARGIN;
            warn!(
                target = "listing.budget",
                tokens,
                limit = self.budget.limit(),
                wait_ms = pause.as_millis() as u64,
                "budget_exhausted"
            );
            crate::metrics::budget_wait(tokens, pause.as_millis());
            sleep(pause).await;
        }
    }
}
