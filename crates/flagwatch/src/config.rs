//! Server configuration.

use std::time::Duration;

use flagwatch_feed::FeedConfig;
use flagwatch_session::SessionConfig;

/// Everything [`FlagwatchServerBuilder`](crate::FlagwatchServerBuilder)
/// needs besides the evaluator and the relay.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on, e.g. `0.0.0.0:8000`.
    pub bind_addr: String,
    /// Timing of watch connections. `evaluation_timeout` also bounds the
    /// one-shot endpoints.
    pub session: SessionConfig,
    pub feed: FeedConfig,
    /// How long graceful shutdown waits for open watches.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            session: SessionConfig::default(),
            feed: FeedConfig::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}
