//! Harvest metrics
//!
//! Handles are registered once per run through the `metrics` macros, so they
//! land in whichever recorder is installed: the Prometheus recorder in the
//! binary, or a [`DebuggingRecorder`](metrics_util::debugging::DebuggingRecorder)
//! handed to [`Metrics::with_recorder`] in tests.

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram, Recorder};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

pub const FETCHES: &str = "skyharvest_fetches_total";
pub const IDENTITIES: &str = "skyharvest_identities_total";
pub const IDENTITIES_RETRIED: &str = "skyharvest_identities_retried_total";
pub const RECORDS_ENQUEUED: &str = "skyharvest_records_enqueued_total";
pub const ENQUEUE_FAILURES: &str = "skyharvest_enqueue_failures_total";
pub const ITEMS_FLUSHED: &str = "skyharvest_items_flushed_total";
pub const FLUSH_FAILURES: &str = "skyharvest_flush_failures_total";
pub const LINES_REJECTED: &str = "skyharvest_lines_rejected_total";
pub const IN_FLIGHT_FLUSHES: &str = "skyharvest_in_flight_flushes";
pub const FETCH_DURATION: &str = "skyharvest_fetch_duration_seconds";

/// Upper bounds (seconds) of the fetch duration buckets
pub const DURATION_BUCKETS_SECS: [f64; 10] =
    [0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0, 1800.0];

/// Installs the global Prometheus recorder
///
/// Nothing is served; the returned handle renders the current values.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(FETCH_DURATION.to_string()), &DURATION_BUCKETS_SECS)?
        .install_recorder()
}

/// Metric handles shared by every stage of a run
#[derive(Clone)]
pub struct Metrics {
    pub fetch_successes: Counter,
    pub fetch_failures: Counter,
    pub identities_completed: Counter,
    pub identities_failed: Counter,
    pub identities_skipped: Counter,
    pub identities_abandoned: Counter,
    pub identities_retried: Counter,
    pub records_enqueued: Counter,
    pub enqueue_failures: Counter,
    pub items_flushed: Counter,
    pub flush_failures: Counter,
    pub lines_rejected: Counter,
    pub in_flight_flushes: Gauge,
    pub fetch_duration: Histogram,
}

impl Metrics {
    /// Registers against the global recorder; a no-op if none is installed
    pub fn new() -> Self {
        Self::register()
    }

    /// Registers against `recorder` instead of the global one
    pub fn with_recorder(recorder: &dyn Recorder) -> Self {
        metrics::with_local_recorder(recorder, Self::register)
    }

    fn register() -> Self {
        Self {
            fetch_successes: counter!(FETCHES, "outcome" => "success"),
            fetch_failures: counter!(FETCHES, "outcome" => "failure"),
            identities_completed: counter!(IDENTITIES, "outcome" => "completed"),
            identities_failed: counter!(IDENTITIES, "outcome" => "failed"),
            identities_skipped: counter!(IDENTITIES, "outcome" => "skipped"),
            identities_abandoned: counter!(IDENTITIES, "outcome" => "abandoned"),
            identities_retried: counter!(IDENTITIES_RETRIED),
            records_enqueued: counter!(RECORDS_ENQUEUED),
            enqueue_failures: counter!(ENQUEUE_FAILURES),
            items_flushed: counter!(ITEMS_FLUSHED),
            flush_failures: counter!(FLUSH_FAILURES),
            lines_rejected: counter!(LINES_REJECTED),
            in_flight_flushes: gauge!(IN_FLIGHT_FLUSHES),
            fetch_duration: histogram!(FETCH_DURATION),
        }
    }

    pub fn observe_fetch(&self, elapsed: Duration) {
        self.fetch_duration.record(elapsed.as_secs_f64());
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Metrics;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
    use std::sync::Arc;

    /// Metrics backed by a private recorder, readable from a test
    pub(crate) struct RecordedMetrics {
        pub(crate) metrics: Arc<Metrics>,
        snapshotter: Snapshotter,
    }

    impl RecordedMetrics {
        pub(crate) fn new() -> Self {
            let recorder = DebuggingRecorder::new();
            let snapshotter = recorder.snapshotter();
            let metrics = Arc::new(Metrics::with_recorder(&recorder));
            Self {
                metrics,
                snapshotter,
            }
        }

        fn find(&self, name: &str, labels: &[(&str, &str)]) -> Option<DebugValue> {
            self.snapshotter
                .snapshot()
                .into_vec()
                .into_iter()
                .find(|(key, _, _, _)| {
                    let key = key.key();
                    key.name() == name
                        && key.labels().count() == labels.len()
                        && labels
                            .iter()
                            .all(|(k, v)| key.labels().any(|l| l.key() == *k && l.value() == *v))
                })
                .map(|(_, _, _, value)| value)
        }

        pub(crate) fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
            match self.find(name, labels) {
                Some(DebugValue::Counter(value)) => value,
                _ => 0,
            }
        }

        pub(crate) fn gauge(&self, name: &str) -> f64 {
            match self.find(name, &[]) {
                Some(DebugValue::Gauge(value)) => value.into_inner(),
                _ => 0.0,
            }
        }

        pub(crate) fn histogram_len(&self, name: &str) -> usize {
            match self.find(name, &[]) {
                Some(DebugValue::Histogram(values)) => values.len(),
                _ => 0,
            }
        }
    }
}
