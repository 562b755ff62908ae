use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

pub const ENTRIES_RECORDED: &str = "welfund_entries_recorded_total";
pub const LOAN_TRANSITIONS: &str = "welfund_loans_transitions_total";
pub const VALIDATION_FAILURES: &str = "welfund_validation_failures_total";

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);

    if logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

pub fn install_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    metrics::describe_counter!(ENTRIES_RECORDED, "Ledger entries appended, by fund and kind");
    metrics::describe_counter!(LOAN_TRANSITIONS, "Loan status changes, by target status");
    metrics::describe_counter!(VALIDATION_FAILURES, "Requests rejected before any write");
    Ok(handle)
}
