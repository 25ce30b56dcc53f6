use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static GATE_OUTCOMES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static DENIALS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static REFUNDS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static UPSTREAM_FAILURES_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static HIDDEN_ITEMS_TOTAL: OnceLock<IntCounter> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "glimpse_gateway_http_requests_total",
                    "Gateway HTTP request count.",
                ),
                &["route", "method", "status"],
            )
            .expect("create glimpse_gateway_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "glimpse_gateway_http_request_duration_seconds",
                    "Gateway HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create glimpse_gateway_http_request_duration_seconds"),
        )
    })
}

fn gate_outcomes_total() -> &'static IntCounterVec {
    GATE_OUTCOMES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "glimpse_gateway_gate_outcomes_total",
                    "Gate reservation outcomes per resource.",
                ),
                &["resource", "outcome"],
            )
            .expect("create glimpse_gateway_gate_outcomes_total"),
        )
    })
}

fn denials_total() -> &'static IntCounterVec {
    DENIALS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "glimpse_gateway_denials_total",
                    "Denied requests by reason.",
                ),
                &["reason"],
            )
            .expect("create glimpse_gateway_denials_total"),
        )
    })
}

fn refunds_total() -> &'static IntCounterVec {
    REFUNDS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "glimpse_gateway_refunds_total",
                    "Reservation refunds by kind.",
                ),
                &["kind"],
            )
            .expect("create glimpse_gateway_refunds_total"),
        )
    })
}

fn upstream_failures_total() -> &'static IntCounter {
    UPSTREAM_FAILURES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "glimpse_gateway_upstream_failures_total",
                "Producer failures observed after a reservation.",
            )
            .expect("create glimpse_gateway_upstream_failures_total"),
        )
    })
}

fn hidden_items_total() -> &'static IntCounter {
    HIDDEN_ITEMS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "glimpse_gateway_hidden_items_total",
                "Result items withheld from callers.",
            )
            .expect("create glimpse_gateway_hidden_items_total"),
        )
    })
}

pub(crate) fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub(crate) fn observe_gate_outcome(resource: &str, outcome: &str) {
    gate_outcomes_total()
        .with_label_values(&[resource, outcome])
        .inc();
}

pub(crate) fn inc_denial(reason: &str) {
    denials_total().with_label_values(&[reason]).inc();
}

pub(crate) fn inc_refund(kind: &str) {
    refunds_total().with_label_values(&[kind]).inc();
}

pub(crate) fn inc_upstream_failure() {
    upstream_failures_total().inc();
}

pub(crate) fn add_hidden_items(count: u64) {
    hidden_items_total().inc_by(count);
}

pub(crate) fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = upstream_failures_total();
    let _ = hidden_items_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
