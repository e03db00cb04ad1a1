//! Prometheus metrics exposition
//!
//! Installs the recorder behind the `metrics` facade that `api-core` emits
//! through. With `--metrics` the rendering is printed after the command runs.
//!
//! `api_call_duration_seconds` renders as a histogram (with `_bucket` lines)
//! rather than the default summary.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Bucket boundaries from 5ms to 60s, covering the retry executor's worst case.
const CALL_DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("api_call_duration_seconds".to_string()),
        CALL_DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder globally and return a handle for rendering.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}
