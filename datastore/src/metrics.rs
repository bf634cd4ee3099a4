use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "datastore_messages_total",
        "Total device messages received from MQTT"
    ))
    .unwrap();
    pub static ref READINGS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "datastore_readings_total",
        "Total readings parsed from device messages"
    ))
    .unwrap();
    pub static ref IGNORED_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "datastore_ignored_messages_total",
        "Total valid messages that carry no storable reading"
    ))
    .unwrap();
    pub static ref INVALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "datastore_invalid_messages_total",
        "Total invalid messages rejected"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "datastore_db_failures_total",
        "Total transient database failures"
    ))
    .unwrap();
    pub static ref WRITE_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "datastore_write_latency_seconds",
            "Time taken to write a batch of readings"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref BATCH_SIZE: Gauge = Gauge::with_opts(Opts::new(
        "datastore_batch_size",
        "Current batch size being written"
    ))
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "datastore_channel_full_total",
        "Total number of times the reading channel was full"
    ))
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone())).unwrap();
    REGISTRY.register(Box::new(READINGS_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(IGNORED_MESSAGES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INVALID_MESSAGES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DB_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(WRITE_LATENCY_SECONDS.clone()))
        .unwrap();
    REGISTRY.register(Box::new(BATCH_SIZE.clone())).unwrap();
    REGISTRY
        .register(Box::new(CHANNEL_FULL_TOTAL.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
