//! Error types for the change feed.

use flagwatch_protocol::ErrorCode;

/// Errors raised by the relay connection or seen by a subscription.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// The relay could not be reached within the retry budget.
    #[error("relay unavailable after {0} attempts")]
    RelayUnavailable(u32),

    /// The subscription's queue was closed (detached or feed shut down).
    #[error("subscription closed")]
    SubscriptionClosed,

    /// The HTTP request to the relay failed.
    #[error("failed to connect to relay: {0}")]
    Connect(#[source] reqwest::Error),

    /// The relay answered with a non-success status.
    #[error("relay returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The event stream broke after it was established.
    #[error("relay stream error: {0}")]
    Stream(String),

    /// The configured relay URL is unusable.
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
}

impl FeedError {
    /// The diagnostic code reported to a watcher whose subscription ended
    /// with this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::SubscriptionClosed => ErrorCode::SubscriptionClosed,
            _ => ErrorCode::RelayUnavailable,
        }
    }
}
