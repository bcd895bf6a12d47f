//! Typed failures of a single classification call.

use std::time::Duration;

use linetag_shared::LinetagError;

/// Why one classification call failed.
///
/// The dispatcher decides how often to retry each variant; the classifier
/// only reports what happened.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassifyError {
    /// The backend answered, but the answer could not be read as proposals.
    #[error("malformed response: {0}")]
    ResponseFormat(String),

    /// Transport or backend failure.
    #[error("backend error: {message}")]
    Backend { message: String, retryable: bool },

    /// The call exceeded its per-call deadline.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}

impl ClassifyError {
    pub fn backend(message: impl Into<String>, retryable: bool) -> Self {
        Self::Backend {
            message: message.into(),
            retryable,
        }
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::ResponseFormat(message.into())
    }

    /// Whether the retry budget for backend errors applies.
    /// Timeouts count as retryable backend errors.
    pub fn is_retryable_backend(&self) -> bool {
        matches!(
            self,
            Self::Backend {
                retryable: true,
                ..
            } | Self::Timeout(_)
        )
    }

    /// Short stable label for logs and the batch log table.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResponseFormat(_) => "response_format",
            Self::Backend { .. } => "backend",
            Self::Timeout(_) => "timeout",
        }
    }
}

impl From<ClassifyError> for LinetagError {
    fn from(err: ClassifyError) -> Self {
        LinetagError::Classification(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability() {
        assert!(ClassifyError::backend("HTTP 503", true).is_retryable_backend());
        assert!(ClassifyError::Timeout(Duration::from_secs(5)).is_retryable_backend());
        assert!(!ClassifyError::backend("HTTP 401", false).is_retryable_backend());
        assert!(!ClassifyError::format("not JSON").is_retryable_backend());
    }

    #[test]
    fn converts_into_shared_error() {
        let err: LinetagError = ClassifyError::format("missing results").into();
        assert_eq!(
            err.to_string(),
            "classification error: malformed response: missing results"
        );
    }
}
