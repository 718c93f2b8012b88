//! # Flagwatch
//!
//! Feature flag evaluation service with live watch over WebSocket.
//!
//! Flagwatch answers one-shot flag evaluations over HTTP and lets clients
//! open a WebSocket watch on a single flag/target pair. A watch receives
//! the current value immediately and a fresh value every time the upstream
//! relay reports a change, until the client leaves or 30 minutes pass.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flagwatch::prelude::*;
//!
//! # async fn start() -> Result<(), FlagwatchError> {
//! let evaluator = HttpEvaluator::new(HttpEvaluatorConfig {
//!     evaluation_url: "https://engine.example.com/api/1.0".into(),
//!     api_key: "server-key".into(),
//!     ..HttpEvaluatorConfig::default()
//! })?;
//! let relay = SseRelay::new("https://relay.example.com/api/1.0", "server-key")?;
//!
//! let server = FlagwatchServerBuilder::new()
//!     .bind("0.0.0.0:8000")
//!     .build(evaluator, relay)
//!     .await?;
//! server.run().await
//! # }
//! ```

mod config;
mod error;
mod handler;
mod routes;
mod server;

pub use config::ServerConfig;
pub use error::FlagwatchError;
pub use server::{FlagwatchServer, FlagwatchServerBuilder};

/// Re-exports everything needed to run a server.
pub mod prelude {
    pub use crate::{FlagwatchError, FlagwatchServer, FlagwatchServerBuilder, ServerConfig};
    pub use flagwatch_eval::{EvalError, Evaluator, HttpEvaluator, HttpEvaluatorConfig};
    pub use flagwatch_feed::{ChangeFeed, FeedConfig, FeedError, FeedStatus, RelayConnector, SseRelay};
    pub use flagwatch_protocol::{
        ChangeEvent, ConnectionId, ErrorCode, EventKind, FlagQuery, FlagRequest, FlagValue,
        Variation, VariationType, WatchMessage,
    };
    pub use flagwatch_session::{ConnectionSession, SessionConfig, SessionRegistry, SessionState};
}
