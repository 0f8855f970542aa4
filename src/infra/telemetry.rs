use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::application::site::METRIC_CACHE_WARM_MS;
use crate::cache::metric_names;
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
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
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            metric_names::METRIC_CACHE_HIT,
            Unit::Count,
            "Total number of cache lookups served from memory."
        );
        describe_counter!(
            metric_names::METRIC_CACHE_MISS,
            Unit::Count,
            "Total number of cache lookups that found no live entry."
        );
        describe_counter!(
            metric_names::METRIC_CACHE_COMPUTE,
            Unit::Count,
            "Total number of cache value computations started."
        );
        describe_counter!(
            metric_names::METRIC_CACHE_COMPUTE_FAILED,
            Unit::Count,
            "Total number of cache value computations that failed."
        );
        describe_counter!(
            metric_names::METRIC_CACHE_INVALIDATED,
            Unit::Count,
            "Total number of cache entries purged by invalidation."
        );
        describe_counter!(
            metric_names::METRIC_CACHE_EXPIRED,
            Unit::Count,
            "Total number of cache entries dropped after their sliding window."
        );
        describe_histogram!(
            METRIC_CACHE_WARM_MS,
            Unit::Milliseconds,
            "Cache warm phase latency in milliseconds."
        );
    });
}
