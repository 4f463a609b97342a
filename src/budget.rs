use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

pub const DEFAULT_TOKENS_PER_MINUTE: u64 = 180_000;

const WINDOW_SECS: f64 = 60.0;

/// Rolling per-minute token budget for outbound model calls.
///
/// Consumption decays linearly with elapsed time and resets outright once a full
/// minute has passed since the last refill. A denied request does not consume.
pub struct TokenBudget {
    limit: u64,
    state: Mutex<BudgetState>,
}

struct BudgetState {
    tokens_used: u64,
    last_refill: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Granted,
    Wait(Duration),
}

impl Admission {
    #[cfg(test)]
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }
}

impl TokenBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            state: Mutex::new(BudgetState {
                tokens_used: 0,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub async fn try_consume(&self, tokens: u64) -> Admission {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let elapsed_minutes = now.duration_since(state.last_refill).as_secs_f64() / WINDOW_SECS;
        if elapsed_minutes >= 1.0 {
            state.tokens_used = 0;
            state.last_refill = now;
        } else if elapsed_minutes > 0.0 {
            let refill = ((self.limit as f64) * elapsed_minutes).floor() as u64;
            state.tokens_used -= state.tokens_used.min(refill);
            state.last_refill = now;
        }

        if state.tokens_used.saturating_add(tokens) > self.limit {
            let since_refill = now.duration_since(state.last_refill).as_secs_f64();
            let wait = (WINDOW_SECS - since_refill).max(0.0);
            return Admission::Wait(Duration::from_secs_f64(wait));
        }

        state.tokens_used += tokens;
        Admission::Granted
    }

    #[cfg(test)]
    async fn used(&self) -> u64 {
        self.state.lock().await.tokens_used
    }
}

/// Shape of one unit of model work, as far as token estimation cares.
#[derive(Debug, Clone, Copy)]
pub struct UnitShape {
    pub group_count: usize,
    pub image_count: usize,
    pub batched: bool,
    pub resolve_fields: bool,
}

/// Rough token demand of one model call; deliberately pessimistic.
pub fn estimate_tokens(prompt: &str, options: &Map<String, Value>, shape: UnitShape) -> u64 {
    let prompt_tokens = prompt.split_whitespace().count() as f64 * 1.3;
    let option_tokens = if options.is_empty() {
        0.0
    } else {
        serde_json::to_string(options)
            .map(|raw| raw.len())
            .unwrap_or_default() as f64
            * 0.3
    };
    let image_tokens = (shape.image_count * 100) as f64;
    let per_unit_output = if shape.resolve_fields { 400.0 } else { 300.0 };
    let output_tokens = per_unit_output * shape.group_count as f64;
    let overhead = if shape.batched {
        50.0 * shape.group_count as f64
    } else {
        0.0
    };

    let total = prompt_tokens + option_tokens + image_tokens + output_tokens + overhead;
    (total * 1.2) as u64
}
