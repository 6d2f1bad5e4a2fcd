//! Tracing and metrics bootstrap.
//!
//! Every module emits through the `tracing` and `metrics` facades, so a
//! host with its own telemetry pipeline can skip [`init`] entirely and
//! still see cache events. [`init`] is for processes where this crate is
//! the only thing wiring telemetry.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing::level_filters::LevelFilter;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::error::CacheError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Log verbosity and output shape for [`init`].
#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), CacheError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            CacheError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register units and help text for every metric this crate emits.
///
/// Idempotent. [`init`] calls it; hosts that install their own recorder
/// can call it directly.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "risposta_hit_total",
            Unit::Count,
            "Total number of cache hits, labeled by store."
        );
        describe_counter!(
            "risposta_miss_total",
            Unit::Count,
            "Total number of cache misses, labeled by store."
        );
        describe_counter!(
            "risposta_entry_expired_total",
            Unit::Count,
            "Total number of entries dropped at expiry, labeled by store."
        );
        describe_counter!(
            "risposta_malformed_entry_total",
            Unit::Count,
            "Total number of undecodable entries evicted from the shared store."
        );
        describe_counter!(
            "risposta_lock_contention_total",
            Unit::Count,
            "Total number of writers turned away while another held the population lock."
        );
        describe_counter!(
            "risposta_transfer_abort_total",
            Unit::Count,
            "Total number of streamed transfers discarded before commit, labeled by reason."
        );
        describe_counter!(
            "risposta_backend_error_total",
            Unit::Count,
            "Total number of shared-store faults absorbed by the fail-open path."
        );
        describe_counter!(
            "risposta_cleared_total",
            Unit::Count,
            "Total number of entries removed by delete and clear operations."
        );
        describe_histogram!(
            "risposta_lookup_ms",
            Unit::Milliseconds,
            "Cache lookup latency in milliseconds, labeled by store."
        );
        describe_histogram!(
            "risposta_commit_ms",
            Unit::Milliseconds,
            "Streamed-commit latency in milliseconds."
        );
    });
}
