//! Prometheus metrics exposition.
//!
//! - `gateway_requests_total` (counter): labels `provider`, `status`, `method`
//! - `gateway_request_duration_seconds` (histogram): labels `provider`, `status`
//! - `gateway_upstream_errors_total` (counter): labels `provider`, `error_type`

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Configures `gateway_request_duration_seconds` with explicit histogram
/// buckets so it renders as a Prometheus histogram (`_bucket` lines for
/// `histogram_quantile()`) instead of the default summary. Bucket
/// boundaries span 5ms to 60s, matching the proxy's configurable timeout
/// range.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                "gateway_request_duration_seconds".to_string(),
            ),
            &[
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
            ],
        )
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed proxy request with provider/status/method labels.
pub fn record_request(provider: &str, status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!(
        "gateway_requests_total",
        "provider" => provider.to_string(),
        "status" => status_str.clone(),
        "method" => method.to_string()
    )
    .increment(1);
    metrics::histogram!(
        "gateway_request_duration_seconds",
        "provider" => provider.to_string(),
        "status" => status_str
    )
    .record(duration_secs);
}

/// Record an upstream error with a provider/classification label.
pub fn record_upstream_error(provider: &str, error_type: &str) {
    metrics::counter!(
        "gateway_upstream_errors_total",
        "provider" => provider.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_request("anthropic", 200, "GET", 0.05);
        record_upstream_error("anthropic", "timeout");
    }

    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Full(
                    "gateway_request_duration_seconds".to_string(),
                ),
                &[
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
                ],
            )
            .expect("failed to set histogram buckets")
            .build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_request_increments_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request("anthropic", 200, "GET", 0.042);
        record_request("openai", 500, "POST", 1.5);

        let output = handle.render();
        assert!(output.contains("gateway_requests_total"));
        assert!(output.contains("provider=\"anthropic\""));
        assert!(output.contains("provider=\"openai\""));
        assert!(output.contains("status=\"200\""));
        assert!(output.contains("method=\"GET\""));
        assert!(output.contains("gateway_request_duration_seconds_bucket"));
    }

    #[test]
    fn record_upstream_error_increments_counter_with_label() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_upstream_error("anthropic", "timeout");
        record_upstream_error("openai", "connection");

        let output = handle.render();
        assert!(output.contains("gateway_upstream_errors_total"));
        assert!(output.contains("error_type=\"timeout\""));
        assert!(output.contains("error_type=\"connection\""));
    }

    #[test]
    fn histogram_buckets_cover_expected_range() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request("anthropic", 200, "GET", 0.003);

        let output = handle.render();
        assert!(output.contains("le=\"0.005\""));
        assert!(output.contains("le=\"0.01\""));
        assert!(output.contains("le=\"60\""));
        assert!(output.contains("le=\"+Inf\""));
    }
}
