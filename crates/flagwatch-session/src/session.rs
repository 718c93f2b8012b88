//! Session types: the server's record of one watch connection.
//!
//! A session tracks:
//! - WHO it is (`ConnectionId`, for log correlation)
//! - WHAT it watches (`FlagQuery`)
//! - WHERE it is in its life (`SessionState`)
//! - WHEN it was accepted (oldest sessions list first)

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flagwatch_feed::SubscriptionId;
use flagwatch_protocol::{ConnectionId, FlagQuery};
use serde::Serialize;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Timing for watch connections.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Hard cap on a watch's lifetime, measured from acceptance.
    ///
    /// Default: 30 minutes.
    pub max_lifetime: Duration,

    /// How long the client has to send its setup message.
    pub setup_timeout: Duration,

    /// Interval between keep-alive pings.
    pub ping_interval: Duration,

    /// Bound on every evaluation a watch performs.
    pub evaluation_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_lifetime: Duration::from_secs(30 * 60),
            setup_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
            evaluation_timeout: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// The lifecycle state of a watch.
///
/// ```text
/// Initializing ──(initial value sent, subscribed)──→ Active
///      │                                               │
///      └──────────(setup failure)──→ Closing ←──(disconnect, cap,
///                                       │         relay loss, send error)
///                                       ▼
///                                    Closed
/// ```
///
/// Asking a `Closing` or `Closed` session to close again is a no-op, so
/// every exit path can request it without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    /// Returns `true` if moving to `target` is allowed (including the
    /// no-op re-close).
    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Initializing, Self::Active)
                | (Self::Initializing, Self::Closing)
                | (Self::Active, Self::Closing)
                | (Self::Closing, Self::Closing)
                | (Self::Closing, Self::Closed)
                | (Self::Closed, Self::Closing)
        )
    }

    /// Returns `true` once closing has started.
    pub fn is_closing(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "Initializing"),
            Self::Active => write!(f, "Active"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionSession
// ---------------------------------------------------------------------------

/// One watch connection as seen by the registry.
///
/// Created once the setup message has been parsed; the id and start
/// instant come from acceptance.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSession {
    pub connection_id: ConnectionId,
    pub query: FlagQuery,
    /// Wall-clock acceptance time, for diagnostics.
    pub created_at: DateTime<Utc>,
    /// Monotonic acceptance time, used for ordering.
    #[serde(skip)]
    pub started: Instant,
    pub state: SessionState,
    /// The feed subscription, once attached.
    pub subscription: Option<SubscriptionId>,
}

impl ConnectionSession {
    pub fn new(
        connection_id: ConnectionId,
        query: FlagQuery,
        created_at: DateTime<Utc>,
        started: Instant,
    ) -> Self {
        Self {
            connection_id,
            query,
            created_at,
            started,
            state: SessionState::Initializing,
            subscription: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_transition_to_follows_lifecycle() {
        use SessionState::*;
        assert!(Initializing.can_transition_to(Active));
        assert!(Initializing.can_transition_to(Closing));
        assert!(Active.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));

        assert!(!Initializing.can_transition_to(Closed));
        assert!(!Active.can_transition_to(Initializing));
        assert!(!Active.can_transition_to(Active));
        assert!(!Closed.can_transition_to(Active));
    }

    #[test]
    fn test_can_transition_to_reclose_is_allowed() {
        assert!(SessionState::Closing.can_transition_to(SessionState::Closing));
        assert!(SessionState::Closed.can_transition_to(SessionState::Closing));
    }

    #[test]
    fn test_session_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.max_lifetime, Duration::from_secs(1800));
        assert_eq!(config.setup_timeout, Duration::from_secs(60));
        assert_eq!(config.ping_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_session_serializes_without_monotonic_clock() {
        let session = ConnectionSession::new(
            ConnectionId::generate(),
            FlagQuery::new("f", "t").unwrap(),
            Utc::now(),
            Instant::now(),
        );
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["state"], "initializing");
        assert_eq!(json["query"]["flag_id"], "f");
        assert!(json.get("started").is_none());
        assert!(json["subscription"].is_null());
    }
}
