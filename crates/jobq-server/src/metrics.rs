use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static JOBS_ENQUEUED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("jobs_enqueued_total", "Total jobs enqueued").unwrap());

pub static ENQUEUES_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "enqueues_rejected_total",
        "Total enqueue requests rejected by validation",
    )
    .unwrap()
});

pub fn init_metrics() {
    // Ignore errors if called multiple times (common in tests)
    let _ = REGISTRY.register(Box::new(JOBS_ENQUEUED.clone()));
    let _ = REGISTRY.register(Box::new(ENQUEUES_REJECTED.clone()));
}

pub fn gather() -> String {
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&metric_families, &mut buf).unwrap();
    String::from_utf8(buf).unwrap()
}
