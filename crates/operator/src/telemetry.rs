use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use once_cell::sync::Lazy;
use prometheus::{histogram_opts, opts, Encoder, Histogram, IntCounter, IntCounterVec, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static RECONCILE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("site_reconcile_total", "Reconcile passes by outcome"), &["outcome"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static RECONCILE_DURATION: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(histogram_opts!(
        "site_reconcile_duration_seconds",
        "Wall time of one reconcile pass",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ))
    .unwrap();
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});
pub static REVISION_TRIGGERS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("site_revision_triggers_total", "Reconciles requested because a branch moved").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static REVISION_CHECK_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("site_revision_check_failures_total", "Failed repo-checker queries").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// Touches every metric so they show up in the first scrape.
pub fn register_all() {
    Lazy::force(&RECONCILE_TOTAL);
    Lazy::force(&RECONCILE_DURATION);
    Lazy::force(&REVISION_TRIGGERS);
    Lazy::force(&REVISION_CHECK_FAILURES);
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&metric_families, &mut buf).is_err() { return StatusCode::INTERNAL_SERVER_ERROR.into_response(); }
    ([("Content-Type", "text/plain; version=0.0.4")], buf).into_response()
}

async fn healthz() -> &'static str { "ok" }

/// `/readyz` answers 503 until `ready` flips to true (the controller has started).
pub fn router(ready: tokio::sync::watch::Receiver<bool>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz))
        .route(
            "/readyz",
            get(move || {
                let ready = *ready.borrow();
                async move { if ready { (StatusCode::OK, "ready") } else { (StatusCode::SERVICE_UNAVAILABLE, "starting") } }
            }),
        )
}
