//! Failure taxonomy shared by adapters, the resolver and the extractor.

use serde::Serialize;

/// Coarse class of a failure, deciding between local retry and surfacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Connect, TLS or timeout failure.
    Transport,
    /// "Too many requests" or "processing, retry later".
    RateLimited,
    /// A bot challenge was served instead of content.
    Blocked,
    /// Expected a document, got something else.
    ShapeMismatch,
    /// Max depth or cycle detected while resolving.
    BoundExceeded,
    /// Document parsed but yielded unusable text.
    Decode,
}

impl ErrorClass {
    /// Transport and rate-limit failures may be retried locally with backoff.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transport | Self::RateLimited)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::RateLimited => "rate_limited",
            Self::Blocked => "blocked",
            Self::ShapeMismatch => "shape_mismatch",
            Self::BoundExceeded => "bound_exceeded",
            Self::Decode => "decode",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_classes_retry() {
        assert!(ErrorClass::Transport.is_retryable());
        assert!(ErrorClass::RateLimited.is_retryable());
        assert!(!ErrorClass::Blocked.is_retryable());
        assert!(!ErrorClass::BoundExceeded.is_retryable());
        assert!(!ErrorClass::Decode.is_retryable());
    }
}
