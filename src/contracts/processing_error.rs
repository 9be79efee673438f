/// Failure classification returned by event handlers.
///
/// This replaces an ad hoc "should ack" marker with explicit routing:
/// - `Retryable`: the dependency was unavailable or erroring; the message is
///   redriven for the salvage sweep (network issues, 5xx, rate limits).
/// - `Permanent`: the data itself cannot be processed; the message is acked
///   and dropped (missing relations, duplicates, 4xx, shape mismatch).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("Retryable error: {reason}")]
    Retryable { reason: String },

    #[error("Permanent error: {reason}")]
    Permanent { reason: String },
}

impl HandlerError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable {
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Retryable { reason } => reason,
            Self::Permanent { reason } => reason,
        }
    }

    /// True when the message must be acked without redrive.
    pub fn should_ack(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Retryable { .. } => "retryable",
            Self::Permanent { .. } => "permanent",
        }
    }
}
