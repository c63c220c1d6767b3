//! Pattern-based error classification.

use crate::pipeline::is_retryable_error;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

static SERVER_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b5\d\d\b").expect("valid server-error regex"));

static TRANSIENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(network|socket|econnrefused|enotfound|epipe|eai_again|dns|broken pipe|connection (refused|closed|aborted))",
    )
    .expect("valid transient-error regex")
});

static CONTENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(content.?(policy|filter|blocked)|safety|moderation|flagged|blocked)")
        .expect("valid content-error regex")
});

static RATE_LIMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(rate.?limit|too many requests|\b429\b)").expect("valid rate-limit regex")
});

static CONTEXT_OVERFLOW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(context.?(length|window|overflow)|maximum context|too many tokens|token limit)")
        .expect("valid context-overflow regex")
});

static RETRY_AFTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)retry.?after:?\s*(\d+(?:\.\d+)?)\s*(ms|milliseconds?|s|secs?|seconds?)?")
        .expect("valid retry-after regex")
});

/// Broad failure category of an error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Rate limits, timeouts, connection resets, 5xx, overload.
    Retryable,
    /// Network and socket errors.
    Transient,
    /// Safety or moderation blocks.
    Content,
    /// Anything else.
    Permanent,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retryable => write!(f, "retryable"),
            Self::Transient => write!(f, "transient"),
            Self::Content => write!(f, "content"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// Classifies an error message.
pub fn classify_error(message: &str) -> ErrorCategory {
    if is_retryable_error(message) || SERVER_ERROR.is_match(message) {
        ErrorCategory::Retryable
    } else if TRANSIENT.is_match(message) {
        ErrorCategory::Transient
    } else if CONTENT.is_match(message) {
        ErrorCategory::Content
    } else {
        ErrorCategory::Permanent
    }
}

/// Whether the message reports a rate limit.
pub fn is_rate_limit(message: &str) -> bool {
    RATE_LIMIT.is_match(message)
}

/// Whether the message reports an oversized prompt.
pub fn is_context_overflow(message: &str) -> bool {
    CONTEXT_OVERFLOW.is_match(message)
}

/// Extracts a "retry after N [unit]" hint. Seconds when no unit is given.
pub fn parse_retry_after(message: &str) -> Option<Duration> {
    let captures = RETRY_AFTER.captures(message)?;
    let amount: f64 = captures.get(1)?.as_str().parse().ok()?;
    let is_ms = captures
        .get(2)
        .is_some_and(|unit| unit.as_str().to_ascii_lowercase().starts_with("ms")
            || unit.as_str().to_ascii_lowercase().starts_with("milli"));

    let seconds = if is_ms { amount / 1000.0 } else { amount };
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(seconds.min(86_400.0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_classification() {
        assert_eq!(classify_error("Rate limit exceeded"), ErrorCategory::Retryable);
        assert_eq!(classify_error("504 gateway timeout"), ErrorCategory::Retryable);
        assert_eq!(classify_error("500 internal error"), ErrorCategory::Retryable);
        assert_eq!(classify_error("socket hang up"), ErrorCategory::Transient);
        assert_eq!(classify_error("getaddrinfo ENOTFOUND api"), ErrorCategory::Transient);
        assert_eq!(classify_error("Output blocked by safety system"), ErrorCategory::Content);
        assert_eq!(classify_error("invalid api key"), ErrorCategory::Permanent);
    }

    #[test]
    fn test_specific_matchers() {
        assert!(is_rate_limit("429 Too Many Requests"));
        assert!(!is_rate_limit("503 service unavailable"));
        assert!(is_context_overflow("This model's maximum context length is 8192 tokens"));
        assert!(!is_context_overflow("timeout"));
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("Please retry after 20 seconds"), Some(Duration::from_secs(20)));
        assert_eq!(parse_retry_after("Retry-After: 3"), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after("retry after 1500ms"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_retry_after("rate limited"), None);
    }
}
