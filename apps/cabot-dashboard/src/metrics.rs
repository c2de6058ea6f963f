use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static COMMANDS_ENQUEUED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("commands_enqueued_total", "Commands dispatched to robots"),
        &["client_id"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static COMMANDS_DELIVERED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("commands_delivered_total", "Commands handed to a polling robot"),
        &["client_id"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static POLLS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("polls_total", "Completed long polls by outcome"),
        &["client_id", "outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static STATUS_REPORTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("status_reports_total", "Status reports received from robots"),
        &["client_id"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static OBSERVERS_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("observers_connected", "Open observer websocket connections").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static BROADCAST_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "broadcast_failures_total",
        "Observer sends that failed and dropped the observer",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn export_prometheus() -> String {
    // touch every family so an idle server still lists them
    Lazy::force(&COMMANDS_ENQUEUED);
    Lazy::force(&COMMANDS_DELIVERED);
    Lazy::force(&POLLS);
    Lazy::force(&STATUS_REPORTS);
    Lazy::force(&OBSERVERS_CONNECTED);
    Lazy::force(&BROADCAST_FAILURES);

    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buf).ok();
    String::from_utf8(buf).unwrap_or_default()
}
