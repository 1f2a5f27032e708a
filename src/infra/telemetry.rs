use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing::level_filters::LevelFilter;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

const QUIET_SQLX_STATEMENTS: &str = "sqlx::query=warn";

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let env_filter = build_env_filter(logging.level, env_directives.as_deref());

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
        .try_init()?;
    Ok(())
}

/// `RUST_LOG` wins when set. Otherwise the configured level applies, with
/// sqlx statement logging held at `warn` for anything more verbose.
fn build_env_filter(level: LevelFilter, env_directives: Option<&str>) -> EnvFilter {
    let builder = EnvFilter::builder().with_default_directive(level.into());
    match env_directives.map(str::trim).filter(|directives| !directives.is_empty()) {
        Some(directives) => builder.parse_lossy(directives),
        None if level > LevelFilter::WARN => builder.parse_lossy(QUIET_SQLX_STATEMENTS),
        None => builder.parse_lossy(""),
    }
}

/// Register metric descriptions with the installed recorder. Safe to call
/// more than once.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "querycache_refresh_total",
            Unit::Count,
            "Endpoint refreshes by outcome (populated, replaced, unchanged, failed)."
        );
        describe_histogram!(
            "querycache_refresh_ms",
            Unit::Milliseconds,
            "Endpoint refresh latency in milliseconds, query through publish."
        );
        describe_gauge!(
            "querycache_entries",
            Unit::Count,
            "Current number of published cache entries."
        );
        describe_counter!(
            "querycache_http_responses_total",
            Unit::Count,
            "Responses served from the cache by status code."
        );
        describe_counter!(
            "querycache_blob_deleted_total",
            Unit::Count,
            "Encrypted blobs deleted after retirement or shutdown."
        );
    });
}
