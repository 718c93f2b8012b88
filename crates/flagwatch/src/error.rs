//! Unified error type for flagwatch.

use flagwatch_eval::EvalError;
use flagwatch_feed::FeedError;
use flagwatch_protocol::{ErrorCode, ProtocolError};
use flagwatch_session::SessionError;
use flagwatch_transport::TransportError;

/// Top-level error that wraps every crate-specific error.
///
/// The `#[from]` attributes let `?` convert sub-crate errors directly.
#[derive(Debug, thiserror::Error)]
pub enum FlagwatchError {
    /// Sending to or receiving from a watch client failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A payload was malformed or invalid.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The session registry rejected an operation.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The evaluation engine failed or timed out.
    #[error(transparent)]
    Eval(#[from] EvalError),

    /// The relay feed failed.
    #[error(transparent)]
    Feed(#[from] FeedError),

    /// Binding or serving the listener failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FlagwatchError {
    /// The code reported to clients for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Protocol(e) if e.is_client_error() => ErrorCode::BadRequest,
            Self::Eval(e) => e.code(),
            Self::Feed(e) => e.code(),
            _ => ErrorCode::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let flagwatch_err: FlagwatchError = err.into();
        assert!(matches!(flagwatch_err, FlagwatchError::Transport(_)));
        assert!(flagwatch_err.to_string().contains("gone"));
        assert_eq!(flagwatch_err.code(), ErrorCode::Internal);
    }

    #[test]
    fn test_from_protocol_error_is_bad_request() {
        let err = ProtocolError::UnsupportedVariationType("float".into());
        let flagwatch_err: FlagwatchError = err.into();
        assert_eq!(flagwatch_err.code(), ErrorCode::BadRequest);
    }

    #[test]
    fn test_from_eval_error_keeps_code() {
        let flagwatch_err: FlagwatchError =
            EvalError::Timeout(Duration::from_secs(5)).into();
        assert_eq!(flagwatch_err.code(), ErrorCode::EvaluationTimeout);
    }

    #[test]
    fn test_from_feed_error() {
        let flagwatch_err: FlagwatchError = FeedError::RelayUnavailable(5).into();
        assert_eq!(flagwatch_err.code(), ErrorCode::RelayUnavailable);
    }
}
