use tracing::trace;

// Counters and timings emitted as trace events under `listing.metrics`.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "listing.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "listing.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn unit_elapsed(mode: &'static str, groups: usize, elapsed_ms: u128) {
    trace!(
        target = "listing.metrics",
        mode = mode,
        groups = groups as u64,
        elapsed_ms = elapsed_ms as u64,
        "unit_elapsed"
    );
}

pub fn retry_scheduled(call: &'static str, rate_limited: bool, delay_ms: u128) {
    trace!(
        target = "listing.metrics",
        call = call,
        rate_limited,
        delay_ms = delay_ms as u64,
        "retry_scheduled"
    );
}

pub fn budget_wait(tokens: u64, wait_ms: u128) {
    trace!(
        target = "listing.metrics",
        tokens,
        wait_ms = wait_ms as u64,
        "budget_wait"
    );
}
