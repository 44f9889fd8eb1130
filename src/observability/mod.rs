pub mod token_counter;

use crate::config::LogFormat;
use crate::protocol::anthropic::AnthropicUsage;
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber with the configured log level.
///
/// Maps config log levels to tracing levels:
/// - "DISABLED" -> no subscriber installed
/// - "WARNING" -> WARN
/// - "CRITICAL" -> ERROR
/// - Others map directly (DEBUG, INFO, ERROR)
///
/// `RUST_LOG`, when set, overrides the configured level.
pub fn init_tracing(log_level: &str, format: LogFormat) {
    let level = log_level.to_uppercase();

    if level == "DISABLED" {
        return;
    }

    let tracing_level = match level.as_str() {
        "WARNING" => "WARN",
        "CRITICAL" => "ERROR",
        other => other,
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(tracing_level))
        .unwrap_or_else(|_| EnvFilter::new("INFO"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Log token usage for a completed request, computing duration from start time.
pub fn log_request_complete(model: &str, usage: &AnthropicUsage, start_time: std::time::Instant) {
    token_counter::log_request_usage(model, usage, start_time.elapsed());
}
