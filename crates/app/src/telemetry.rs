use std::{
    fmt::Write as _,
    sync::{Mutex, OnceLock, PoisonError},
    time::Instant,
};

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self as tracing_fmt, time::UtcTime},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer, Registry,
};

use sns_trigger_util::{AppConfig, Environment};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize tracing: {0}")]
    Tracing(#[from] TryInitError),
    #[error("failed to initialize prometheus recorder: {0}")]
    Metrics(#[from] BuildError),
}

enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

/// Every metric the service emits, described once when the recorder is installed.
const CATALOGUE: &[(MetricKind, &str, &str)] = &[
    (MetricKind::Gauge, "app_build_info", "Build metadata for the running binary"),
    (MetricKind::Gauge, "app_uptime_seconds", "Seconds since the process started"),
    (
        MetricKind::Counter,
        "sns_ingress_total",
        "SNS webhook requests processed, labelled by message type",
    ),
    (
        MetricKind::Counter,
        "sns_invalid_signature_total",
        "SNS webhook requests dropped because the signature did not verify",
    ),
    (
        MetricKind::Counter,
        "sns_rejected_total",
        "Verified SNS messages rejected, labelled by reason",
    ),
    (
        MetricKind::Histogram,
        "webhook_ack_latency_seconds",
        "Seconds taken to answer an SNS webhook request",
    ),
    (
        MetricKind::Counter,
        "trigger_store_flush_conflicts_total",
        "Trigger storage flushes that found a concurrent modification",
    ),
    (
        MetricKind::Counter,
        "trigger_store_flush_abandoned_total",
        "Trigger storage flushes given up after the last retry",
    ),
    (
        MetricKind::Counter,
        "builds_queued_total",
        "Builds queued from SNS notifications",
    ),
];

static TRACING_READY: OnceLock<()> = OnceLock::new();
static RECORDER: Mutex<Option<PrometheusHandle>> = Mutex::new(None);
static STARTED_AT: OnceLock<Instant> = OnceLock::new();

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn git_sha() -> &'static str {
    option_env!("GIT_SHA").unwrap_or("unknown")
}

/// Installs the global subscriber: pretty output outside production, JSON lines in it.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryError> {
    if TRACING_READY.get().is_some() {
        return Ok(());
    }

    let base = tracing_fmt::layer()
        .with_target(false)
        .with_timer(UtcTime::rfc_3339());
    let output: Box<dyn Layer<Registry> + Send + Sync> = match config.environment {
        Environment::Production => base.json().boxed(),
        Environment::Development | Environment::Test => base.pretty().boxed(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .try_init()?;
    TRACING_READY.set(()).ok();

    tracing::info!(
        stage = "telemetry",
        env = %config.environment.as_str(),
        version = VERSION,
        git_sha = git_sha(),
        "tracing initialized"
    );
    Ok(())
}

/// Installs the Prometheus recorder once and hands out its handle.
pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    let mut recorder = RECORDER.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(handle) = recorder.as_ref() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    for (kind, name, description) in CATALOGUE {
        match kind {
            MetricKind::Counter => describe_counter!(*name, *description),
            MetricKind::Gauge => describe_gauge!(*name, *description),
            MetricKind::Histogram => describe_histogram!(*name, *description),
        }
    }
    STARTED_AT.get_or_init(Instant::now);

    *recorder = Some(handle.clone());
    Ok(handle)
}

/// Recorder output followed by the build info and uptime gauges.
pub fn render_metrics(handle: &PrometheusHandle) -> String {
    let mut body = handle.render();
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }

    let uptime = STARTED_AT
        .get()
        .map(|started| started.elapsed().as_secs_f64())
        .unwrap_or_default();
    let _ = writeln!(body, "# TYPE app_build_info gauge");
    let _ = writeln!(
        body,
        "app_build_info{{version=\"{VERSION}\",git=\"{}\"}} 1",
        git_sha()
    );
    let _ = writeln!(body, "# TYPE app_uptime_seconds gauge");
    let _ = writeln!(body, "app_uptime_seconds {uptime}");
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_is_installed_once() {
        let first = init_metrics().expect("metrics");
        let second = init_metrics().expect("metrics again");
        metrics::counter!("builds_queued_total").increment(1);

        let body = render_metrics(&second);
        assert!(body.contains("builds_queued_total"));
        assert!(render_metrics(&first).contains("builds_queued_total"));
        assert!(body.contains(&format!("app_build_info{{version=\"{VERSION}\"")));
        assert!(body.contains("app_uptime_seconds "));
    }
}
