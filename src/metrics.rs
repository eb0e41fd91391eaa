use tracing::trace;

// Counter helpers emit trace events under their own target; the Prometheus
// recorder installed at startup owns the /metrics export surface.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "ecoloop.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "ecoloop.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn tier_used(tier: &'static str) {
    trace!(
        target = "ecoloop.metrics",
        tier = tier,
        "estimation_tier_used"
    );
}

pub fn duplicate_rejected() {
    trace!(target = "ecoloop.metrics", "duplicate_listing_rejected");
}

pub fn lead_action(action: &'static str) {
    trace!(target = "ecoloop.metrics", action = action, "lead_action");
}
