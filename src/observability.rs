use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber with the configured log level.
///
/// Maps config log levels to tracing levels:
/// - "DISABLED" -> no subscriber installed
/// - "WARNING" -> WARN
/// - "CRITICAL" -> ERROR
/// - Others map directly (DEBUG, INFO, ERROR)
pub fn init_tracing(log_level: &str) {
    let level = log_level.to_uppercase();

    if level == "DISABLED" {
        return;
    }

    let tracing_level = match level.as_str() {
        "WARNING" => "WARN",
        "CRITICAL" => "ERROR",
        other => other,
    };

    let filter = EnvFilter::try_new(tracing_level).unwrap_or_else(|_| EnvFilter::new("INFO"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Token usage for one request, either provider-reported or estimated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

/// Estimate the number of tokens in `text`.
///
/// Uses a lightweight heuristic (`bytes / 4`) to avoid loading model BPE tables.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Estimate tokens from a streamed body byte count.
#[must_use]
pub fn estimate_tokens_from_bytes(byte_count: u64) -> u64 {
    byte_count.div_ceil(4)
}

/// Merge upstream-reported usage with local estimates.
///
/// - Always prefer upstream non-zero values
/// - Only fill `None` or zero fields with estimates
/// - Compute total = input + output when total is missing
#[must_use]
pub fn merge_usage(upstream: &TokenUsage, estimated_input: u64, estimated_output: u64) -> TokenUsage {
    let input_tokens = match upstream.input_tokens {
        Some(v) if v > 0 => Some(v),
        _ => Some(estimated_input),
    };

    let output_tokens = match upstream.output_tokens {
        Some(v) if v > 0 => Some(v),
        _ => Some(estimated_output),
    };

    let total_tokens = match upstream.total_tokens {
        Some(v) if v > 0 => Some(v),
        _ => {
            let i = input_tokens.unwrap_or(0);
            let o = output_tokens.unwrap_or(0);
            Some(i + o)
        }
    };

    TokenUsage {
        input_tokens,
        output_tokens,
        total_tokens,
    }
}

/// Log token usage for a completed request at INFO level.
pub fn log_request_complete(
    model: &str,
    key_id: &str,
    usage: &TokenUsage,
    cost_usd: f64,
    duration: Duration,
) {
    info!(
        model = model,
        key = key_id,
        input_tokens = usage.input_tokens.unwrap_or(0),
        output_tokens = usage.output_tokens.unwrap_or(0),
        total_tokens = usage.total_tokens.unwrap_or(0),
        cost_usd = cost_usd,
        duration_seconds = duration.as_secs_f64(),
        "request completed"
    );
}
