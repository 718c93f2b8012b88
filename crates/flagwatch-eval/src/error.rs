//! Error types for the evaluation client.

use std::time::Duration;

use flagwatch_protocol::{ErrorCode, ProtocolError};

/// Errors returned by an [`Evaluator`](crate::Evaluator).
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// The engine does not know the flag.
    #[error("flag {0} not found")]
    FlagNotFound(String),

    /// The engine does not know the target.
    #[error("target {0} not found")]
    TargetNotFound(String),

    /// The engine did not answer within the bound.
    #[error("evaluation timed out after {0:?}")]
    Timeout(Duration),

    /// The API key was rejected.
    #[error("evaluation engine rejected credentials: {0}")]
    Unauthorized(String),

    /// The engine answered with an unexpected status.
    #[error("evaluation engine returned {status}: {message}")]
    Upstream { status: u16, message: String },

    /// The request never got an answer (DNS, TLS, connection reset…).
    #[error("request to evaluation engine failed: {0}")]
    Request(#[source] reqwest::Error),

    /// The configured engine URL is unusable.
    #[error("invalid evaluation engine url: {0}")]
    InvalidUrl(String),

    /// The engine's value doesn't fit the requested variation type.
    #[error(transparent)]
    InvalidValue(#[from] ProtocolError),
}

impl EvalError {
    /// The diagnostic code reported to clients.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::FlagNotFound(_) => ErrorCode::FlagNotFound,
            Self::TargetNotFound(_) => ErrorCode::TargetNotFound,
            Self::Timeout(_) => ErrorCode::EvaluationTimeout,
            Self::Unauthorized(_)
            | Self::Upstream { .. }
            | Self::Request(_)
            | Self::InvalidUrl(_)
            | Self::InvalidValue(_) => ErrorCode::EvaluationFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_maps_taxonomy() {
        assert_eq!(
            EvalError::FlagNotFound("f".into()).code(),
            ErrorCode::FlagNotFound
        );
        assert_eq!(
            EvalError::TargetNotFound("t".into()).code(),
            ErrorCode::TargetNotFound
        );
        assert_eq!(
            EvalError::Timeout(Duration::from_secs(1)).code(),
            ErrorCode::EvaluationTimeout
        );
        assert_eq!(
            EvalError::Upstream {
                status: 500,
                message: "boom".into()
            }
            .code(),
            ErrorCode::EvaluationFailed
        );
    }
}
