use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::warn;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static CONNECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "fanout_gateway_connections_total",
        "websocket connections accepted",
    ))
    .expect("valid counter");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::with_opts(Opts::new(
        "fanout_gateway_connections_active",
        "websocket connections currently held by this instance",
    ))
    .expect("valid gauge");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static PUBLISH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "fanout_gateway_publish_total",
            "channel publishes by result",
        ),
        &["result"],
    )
    .expect("valid counter vec");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn record_publish(success: bool) {
    let result = if success { "ok" } else { "error" };
    PUBLISH_TOTAL.with_label_values(&[result]).inc();
}

pub fn gather() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %err, "metrics encode error");
    }
    buffer
}
