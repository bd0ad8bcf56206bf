//! Metric emission helpers plus the Prometheus exposition route. Metric
//! names are part of the operational contract; dashboards and alerts key on
//! them.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Interactive,
    Batch,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Interactive => "interactive",
            Mode::Batch => "batch",
        }
    }
}

pub fn record_generation(template: &str, output_format: &str, mode: Mode, elapsed_ms: f64) {
    metrics::histogram!(
        "docgen_duration_ms",
        "templateId" => template.to_string(),
        "outputFormat" => output_format.to_string(),
        "mode" => mode.as_str(),
    )
    .record(elapsed_ms);
}

pub fn record_failure(reason: &'static str, mode: Mode) {
    metrics::counter!("docgen_failures_total", "reason" => reason, "mode" => mode.as_str())
        .increment(1);
}

pub fn record_cache(stats: &template_cache::CacheStats, hit: bool) {
    if hit {
        metrics::counter!("template_cache_hit").increment(1);
    } else {
        metrics::counter!("template_cache_miss").increment(1);
    }
    metrics::gauge!("template_cache_resident_bytes").set(stats.resident_bytes as f64);
}

pub fn record_pool(stats: &convert::PoolStats) {
    metrics::gauge!("conversion_pool_active").set(stats.active as f64);
    metrics::gauge!("conversion_pool_queued").set(stats.queued as f64);
}

pub fn record_idempotency_hit() {
    metrics::counter!("idempotency_cache_hit").increment(1);
}

/// Installs the Prometheus recorder and returns the render handle for the
/// `/metrics` route. The recorder is process-global; repeated calls share
/// the first installation.
pub fn install_recorder() -> PrometheusHandle {
    static HANDLE: std::sync::OnceLock<PrometheusHandle> = std::sync::OnceLock::new();
    HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .set_buckets(
                    &prometheus::exponential_buckets(1.0, 2.5, 15)
                        .expect("calculating histogram buckets"),
                )
                .expect("calculating histogram buckets")
                .install_recorder()
                .expect("failed to install prometheus recorder")
        })
        .clone()
}

#[tracing::instrument(skip_all)]
pub async fn prometheus_metrics(
    axum::extract::State(handle): axum::extract::State<PrometheusHandle>,
) -> (axum::http::StatusCode, String) {
    (axum::http::StatusCode::OK, handle.render())
}
