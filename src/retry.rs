use crate::config::RetrySettings;
use rand::Rng;
use std::{fmt::Display, future::Future};
use tokio::time::{Duration, sleep};
use tracing::warn;

/// Errors that know whether they came from provider throttling.
pub trait Throttled {
    fn is_rate_limited(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    Success { value: T, attempts: u32 },
    Exhausted { attempts: u32, last_error: String },
}

/// Delay before retry number `retries` (1-based).
///
/// Throttled failures get `2^retries * (1 + U[0,1))` units, everything else a plain
/// `2^retries` units.
pub fn backoff_delay(retries: u32, rate_limited: bool, base: Duration) -> Duration {
    let exponential = 2_f64.powi(retries.min(20) as i32);
    let factor = if rate_limited {
        exponential * (1.0 + rand::rng().random::<f64>())
    } else {
        exponential
    };
    Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

/// Runs `op` up to `max_retries + 1` times, sleeping between failed attempts.
pub async fn with_retry<T, E, F, Fut>(
    settings: &RetrySettings,
    label: &'static str,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Throttled + Display,
{
    let total = settings.max_retries.saturating_add(1);
    let mut retries = 0;
    loop {
        let attempt = retries + 1;
        match op(attempt).await {
            Ok(value) => {
                return RetryOutcome::Success {
                    value,
                    attempts: attempt,
                };
            }
            Err(err) => {
                retries += 1;
                let last_error = err.to_string();
                warn!(
                    target = "listing.retry",
                    call = label,
                    attempt,
                    total,
                    error = %last_error,
                    "model_call_failed"
                );
                if retries > settings.max_retries {
                    return RetryOutcome::Exhausted {
                        attempts: attempt,
                        last_error,
                    };
                }
                let rate_limited = err.is_rate_limited();
                let delay = backoff_delay(retries, rate_limited, settings.base_delay);
                crate::metrics::retry_scheduled(label, rate_limited, delay.as_millis());
                sleep(delay).await;
            }
        }
    }
}
