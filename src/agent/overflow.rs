//! Classification of model-call failures: decide retry vs respond.

/// What kind of failure a prompt error string represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The prompt no longer fits the context window
    ContextOverflow,
    /// Worth retrying with backoff
    Transient,
    Unknown,
}

const OVERFLOW_PATTERNS: &[&str] = &[
    "request_too_large",
    "context length exceeded",
    "context_length_exceeded",
    "prompt is too long",
    "maximum context length",
];

const TRANSIENT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "429",
    "503",
    "529",
    "overloaded",
    "connection reset",
    "connection closed",
    "timed out",
    "timeout",
];

pub fn classify(error: &str) -> FailureKind {
    let lower = error.to_lowercase();
    if OVERFLOW_PATTERNS.iter().any(|p| lower.contains(p)) {
        return FailureKind::ContextOverflow;
    }
    if lower.contains("413") && lower.contains("too large") {
        return FailureKind::ContextOverflow;
    }
    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return FailureKind::Transient;
    }
    FailureKind::Unknown
}

/// Maximum transient retries per run.
pub const MAX_TRANSIENT_RETRIES: u32 = 2;

/// Backoff before a transient retry: `min(1000 * 2^attempt, 15000)` ms.
pub fn transient_delay_ms(attempt: u32) -> u64 {
    let base = 1000u64.saturating_mul(1 << attempt.min(10));
    base.min(15_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_patterns_are_recognized() {
        assert_eq!(
            classify("Model endpoint returned 400: prompt is too long: 210000 tokens"),
            FailureKind::ContextOverflow
        );
        assert_eq!(
            classify("request_too_large"),
            FailureKind::ContextOverflow
        );
        assert_eq!(
            classify("HTTP 413: payload too large"),
            FailureKind::ContextOverflow
        );
    }

    #[test]
    fn transient_patterns_are_recognized() {
        assert_eq!(classify("429 Too Many Requests"), FailureKind::Transient);
        assert_eq!(classify("server overloaded, retry later"), FailureKind::Transient);
        assert_eq!(classify("connection reset by peer"), FailureKind::Transient);
        assert_eq!(classify("request timed out"), FailureKind::Transient);
        assert_eq!(classify("Model endpoint returned 503: unavailable"), FailureKind::Transient);
    }

    #[test]
    fn anything_else_is_unknown() {
        assert_eq!(classify("invalid api key"), FailureKind::Unknown);
    }

    #[test]
    fn transient_delay_doubles_and_caps() {
        assert_eq!(transient_delay_ms(0), 1000);
        assert_eq!(transient_delay_ms(1), 2000);
        assert_eq!(transient_delay_ms(2), 4000);
        assert_eq!(transient_delay_ms(6), 15_000);
        assert_eq!(transient_delay_ms(30), 15_000);
    }
}
