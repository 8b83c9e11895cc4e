use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::parse_bool_env;

static INIT: OnceCell<()> = OnceCell::new();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    Compact,
    Json,
}

fn observability_enabled(lookup: &impl Fn(&str) -> Option<String>) -> bool {
    lookup("AGENT_STREAM_OBSERVABILITY")
        .and_then(|value| parse_bool_env(&value))
        .unwrap_or(true)
}

fn log_format(lookup: &impl Fn(&str) -> Option<String>) -> LogFormat {
    match lookup("AGENT_STREAM_LOG_FORMAT")
        .map(|value| value.trim().to_ascii_lowercase())
        .as_deref()
    {
        Some("json") => LogFormat::Json,
        _ => LogFormat::Compact,
    }
}

fn resolve_env_filter() -> tracing_subscriber::EnvFilter {
    if let Ok(level) = std::env::var("AGENT_STREAM_LOG_LEVEL")
        && let Ok(filter) = tracing_subscriber::EnvFilter::try_new(level)
    {
        return filter;
    }
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Initialize logging once per process.
///
/// Environment variables:
/// - `AGENT_STREAM_OBSERVABILITY`: optional enable/disable flag (default enabled).
/// - `AGENT_STREAM_LOG_LEVEL`: optional level/filter override (`info`, `agent_stream=debug`, ...).
/// - `RUST_LOG`: fallback filter when the above is unset or invalid.
/// - `AGENT_STREAM_LOG_FORMAT`: `compact` (default) or `json`, both on stdout.
pub fn init_observability() {
    INIT.get_or_init(|| {
        let lookup = |key: &str| std::env::var(key).ok();
        if !observability_enabled(&lookup) {
            return;
        }

        let env_filter = resolve_env_filter();
        match log_format(&lookup) {
            LogFormat::Json => {
                let json_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(false)
                    .with_writer(std::io::stdout);
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(json_layer)
                    .try_init();
            }
            LogFormat::Compact => {
                let console_layer = tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stdout);
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(console_layer)
                    .try_init();
            }
        }
    });
}
