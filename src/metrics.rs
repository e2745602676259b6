use metrics::{counter, histogram};
use tracing::trace;

pub fn inc_requests(route: &'static str) {
    counter!("bridge_requests_total", "route" => route).increment(1);
    trace!(
        target = "bridge.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    histogram!("bridge_stage_elapsed_ms", "stage" => stage).record(elapsed_ms as f64);
    trace!(
        target = "bridge.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn provision_outcome(product_type: &'static str, outcome: &'static str) {
    counter!(
        "bridge_provision_total",
        "product_type" => product_type,
        "outcome" => outcome
    )
    .increment(1);
}

pub fn job_items(job: &'static str, result: &'static str, count: usize) {
    counter!("bridge_job_items_total", "job" => job, "result" => result).increment(count as u64);
}
