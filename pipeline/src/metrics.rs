use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref INGEST_ITEMS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "pipeline_ingest_items_total",
        "Total ingest payload items received"
    ))
    .unwrap();
    pub static ref ROWS_CREATED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "pipeline_rows_created_total",
        "Total telemetry rows created (conflicts excluded)"
    ))
    .unwrap();
    pub static ref VALIDATION_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "pipeline_validation_failures_total",
        "Total item- and metric-level validation failures"
    ))
    .unwrap();
    pub static ref RULES_EVALUATED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "pipeline_rules_evaluated_total",
        "Total rule evaluations"
    ))
    .unwrap();
    pub static ref EVENTS_CREATED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "pipeline_events_created_total",
        "Total events created by triggered rules"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "pipeline_db_failures_total",
        "Total transient database insert failures"
    ))
    .unwrap();
    pub static ref DELIVERY_BACKPRESSURE_TOTAL: Counter = Counter::with_opts(Opts::new(
        "pipeline_delivery_backpressure_total",
        "Total times the delivery queue was full"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "pipeline_ingest_latency_seconds",
            "Time from validated payload to stored rows and evaluated rules"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY
        .register(Box::new(INGEST_ITEMS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ROWS_CREATED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(VALIDATION_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(RULES_EVALUATED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(EVENTS_CREATED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DB_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DELIVERY_BACKPRESSURE_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INGEST_LATENCY_SECONDS.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
