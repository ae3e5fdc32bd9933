//! Prometheus instrumentation for the CDP session.

use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{
    core::Collector, histogram_opts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};
use tracing::error;

lazy_static! {
    static ref COMMANDS: IntCounterVec = IntCounterVec::new(
        Opts::new("flowprobe_cdp_commands_total", "CDP commands sent, by method and result"),
        &["method", "result"]
    )
    .unwrap();
    static ref COMMAND_SECONDS: HistogramVec = HistogramVec::new(
        histogram_opts!(
            "flowprobe_cdp_command_duration_seconds",
            "Round trip of successful CDP commands",
            vec![0.005, 0.025, 0.1, 0.25, 1.0, 5.0]
        ),
        &["method"]
    )
    .unwrap();
    static ref EVENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("flowprobe_cdp_events_total", "Page events dispatched, by CDP method"),
        &["method"]
    )
    .unwrap();
    static ref CONTINUATIONS: IntCounter = IntCounter::new(
        "flowprobe_cdp_continuations_total",
        "Paused requests resumed"
    )
    .unwrap();
}

/// Totals since process start, summed over labels.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdapterMetricsSnapshot {
    pub commands_ok: u64,
    pub commands_failed: u64,
    pub events: u64,
    pub continuations: u64,
}

pub fn register_metrics(registry: &Registry) {
    let collectors: [Box<dyn Collector>; 4] = [
        Box::new(COMMANDS.clone()),
        Box::new(COMMAND_SECONDS.clone()),
        Box::new(EVENTS.clone()),
        Box::new(CONTINUATIONS.clone()),
    ];
    for collector in collectors {
        match registry.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(err) => error!(?err, "failed to register cdp metric"),
        }
    }
}

/// Count one finished command; latency is only observed for successes.
pub fn observe_command(method: &str, elapsed: Duration, ok: bool) {
    let result = if ok { "ok" } else { "error" };
    COMMANDS.with_label_values(&[method, result]).inc();
    if ok {
        COMMAND_SECONDS
            .with_label_values(&[method])
            .observe(elapsed.as_secs_f64());
    }
}

pub fn record_event(method: &str) {
    EVENTS.with_label_values(&[method]).inc();
}

pub fn record_continuation() {
    CONTINUATIONS.inc();
}

fn sum(vec: &IntCounterVec, matches: impl Fn(&[prometheus::proto::LabelPair]) -> bool) -> u64 {
    vec.collect()
        .iter()
        .flat_map(|family| family.get_metric())
        .filter(|metric| matches(metric.get_label()))
        .map(|metric| metric.get_counter().get_value() as u64)
        .sum()
}

fn result_is(labels: &[prometheus::proto::LabelPair], want: &str) -> bool {
    labels
        .iter()
        .any(|label| label.get_name() == "result" && label.get_value() == want)
}

pub fn snapshot() -> AdapterMetricsSnapshot {
    AdapterMetricsSnapshot {
        commands_ok: sum(&COMMANDS, |labels| result_is(labels, "ok")),
        commands_failed: sum(&COMMANDS, |labels| result_is(labels, "error")),
        events: sum(&EVENTS, |_| true),
        continuations: CONTINUATIONS.get(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_split_by_result() {
        let before = snapshot();
        observe_command("Fetch.continueRequest", Duration::from_micros(150), true);
        observe_command("Fetch.continueRequest", Duration::ZERO, false);
        record_continuation();
        let after = snapshot();
        assert!(after.commands_ok > before.commands_ok);
        assert!(after.commands_failed > before.commands_failed);
        assert!(after.continuations > before.continuations);
    }

    #[test]
    fn registers_on_a_custom_registry_twice() {
        let registry = Registry::new();
        register_metrics(&registry);
        register_metrics(&registry);
        record_event("Fetch.requestPaused");
        assert!(registry
            .gather()
            .iter()
            .any(|family| family.get_name() == "flowprobe_cdp_events_total"));
    }
}
