use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

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
            "tierguard_clear_total",
            Unit::Count,
            "Cache clears by scope and outcome."
        );
        describe_histogram!(
            "tierguard_clear_ms",
            Unit::Milliseconds,
            "Wall time of a cache clear in milliseconds."
        );
        describe_counter!(
            "tierguard_gateway_total",
            Unit::Count,
            "Gateway decisions by cache status."
        );
        describe_counter!(
            "tierguard_object_cache_hit_total",
            Unit::Count,
            "Object cache hits."
        );
        describe_counter!(
            "tierguard_object_cache_miss_total",
            Unit::Count,
            "Object cache misses."
        );
        describe_counter!(
            "tierguard_object_cache_evict_total",
            Unit::Count,
            "Object cache evictions due to capacity."
        );
        describe_counter!(
            "tierguard_purge_dispatch_total",
            Unit::Count,
            "Edge purge requests by delivery result."
        );
        describe_counter!(
            "tierguard_origin_populate_total",
            Unit::Count,
            "Origin responses written back into the cache tiers."
        );
    });
}
