use std::time::Duration;

use cdp_adapter::metrics as cdp_metrics;
use once_cell::sync::{Lazy, OnceCell};
use prometheus::{histogram_opts, Encoder, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::error;

static GLOBAL_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);
static REGISTER_ONCE: OnceCell<()> = OnceCell::new();

static FLOW_RUNS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("flowprobe_flow_runs_total", "Completed flow runs by outcome"),
        &["outcome"],
    )
    .unwrap()
});

static FLOW_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        histogram_opts!(
            "flowprobe_flow_duration_seconds",
            "Wall time of a flow run",
            vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
        ),
        &["outcome"],
    )
    .unwrap()
});

pub fn register_metrics() {
    REGISTER_ONCE.get_or_init(|| {
        let registry = global_registry();
        for collector in [
            Box::new(FLOW_RUNS_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(FLOW_DURATION_SECONDS.clone()),
        ] {
            if let Err(err) = registry.register(collector) {
                error!(?err, "failed to register flow metric");
            }
        }
        cdp_metrics::register_metrics(registry);
    });
}

pub fn record_run(passed: bool, elapsed: Duration) {
    let outcome = if passed { "passed" } else { "failed" };
    FLOW_RUNS_TOTAL.with_label_values(&[outcome]).inc();
    FLOW_DURATION_SECONDS
        .with_label_values(&[outcome])
        .observe(elapsed.as_secs_f64());
}

/// Prometheus text exposition of everything registered so far.
pub fn render() -> String {
    register_metrics();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&global_registry().gather(), &mut buffer) {
        error!(?err, "failed to encode prometheus metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_else(|err| {
        error!(?err, "failed to convert prometheus metrics to utf8");
        String::new()
    })
}

pub fn global_registry() -> &'static Registry {
    &GLOBAL_REGISTRY
}
