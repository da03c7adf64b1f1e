//! In-process operation counters and fan-out latency, in the teacher's
//! `core::metrics` shape: `lazy_static`-registered Prometheus collectors,
//! read back only for a local summary — there is no scrape endpoint (§2
//! Observability is explicit that this crate does not run a metrics
//! server).

use lazy_static::lazy_static;
use prometheus::{CounterVec, Histogram, register_counter_vec, register_histogram};
use tracing::info;

lazy_static! {
    /// Every `Coordinator` operation attempted, labeled by action name.
    pub static ref OPS_ATTEMPTED_TOTAL: CounterVec = register_counter_vec!(
        "mcvirtd_ops_attempted_total",
        "Total coordinator operations attempted, labeled by action.",
        &["action"]
    )
    .unwrap();
    /// Operations whose local effect and every peer replay both succeeded.
    pub static ref OPS_SUCCEEDED_TOTAL: CounterVec = register_counter_vec!(
        "mcvirtd_ops_succeeded_total",
        "Total coordinator operations that completed successfully, labeled by action.",
        &["action"]
    )
    .unwrap();
    /// Operations that returned an error, whether from the local effect,
    /// permission check, lock acquisition, or a peer replay.
    pub static ref OPS_FAILED_TOTAL: CounterVec = register_counter_vec!(
        "mcvirtd_ops_failed_total",
        "Total coordinator operations that failed, labeled by action.",
        &["action"]
    )
    .unwrap();
    /// Wall-clock time for one fan-out, from lock acquisition through
    /// lock release, regardless of outcome.
    pub static ref FANOUT_LATENCY_SECONDS: Histogram = register_histogram!(
        "mcvirtd_fanout_latency_seconds",
        "Latency of one coordinator fan-out operation in seconds."
    )
    .unwrap();
}

/// Records the outcome of one coordinator operation. `elapsed_secs` is the
/// full fan-out duration regardless of outcome.
pub fn record_op(action: &str, elapsed_secs: f64, succeeded: bool) {
    OPS_ATTEMPTED_TOTAL.with_label_values(&[action]).inc();
    if succeeded {
        OPS_SUCCEEDED_TOTAL.with_label_values(&[action]).inc();
    } else {
        OPS_FAILED_TOTAL.with_label_values(&[action]).inc();
    }
    FANOUT_LATENCY_SECONDS.observe(elapsed_secs);
}

/// Logs a one-line-per-family summary of every registered counter/histogram,
/// called once as a worker process is about to exit.
pub fn log_summary() {
    for family in prometheus::gather() {
        for metric in family.get_metric() {
            let labels: Vec<String> = metric
                .get_label()
                .iter()
                .map(|l| format!("{}={}", l.get_name(), l.get_value()))
                .collect();
            if metric.has_counter() {
                info!(
                    metric = family.get_name(),
                    labels = %labels.join(","),
                    value = metric.get_counter().get_value(),
                    "metrics summary"
                );
            } else if metric.has_histogram() {
                let h = metric.get_histogram();
                info!(
                    metric = family.get_name(),
                    count = h.get_sample_count(),
                    sum = h.get_sample_sum(),
                    "metrics summary"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_op_updates_counters_and_histogram() {
        let before = OPS_ATTEMPTED_TOTAL
            .with_label_values(&["test-action"])
            .get();
        record_op("test-action", 0.01, true);
        let after = OPS_ATTEMPTED_TOTAL
            .with_label_values(&["test-action"])
            .get();
        assert_eq!(after, before + 1.0);
        assert_eq!(
            OPS_SUCCEEDED_TOTAL.with_label_values(&["test-action"]).get(),
            1.0
        );
    }
}
