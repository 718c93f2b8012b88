//! `FlagwatchServer` builder and server loop.
//!
//! This is the entry point for running flagwatch. It ties together all
//! the layers: transport → protocol → session, with the evaluator and the
//! change feed plugged in underneath.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use flagwatch_eval::Evaluator;
use flagwatch_feed::{ChangeFeed, FeedConfig, RelayConnector};
use flagwatch_protocol::JsonCodec;
use flagwatch_session::{SessionConfig, SessionRegistry};
use tokio::net::TcpListener;

use crate::routes::router;
use crate::{FlagwatchError, ServerConfig};

/// Shared server state passed to every request and watch task.
///
/// Wrapped in `Arc` so it can be cheaply cloned across tasks. The
/// registry and the feed synchronize internally.
pub(crate) struct ServerState<E: Evaluator> {
    pub(crate) evaluator: E,
    pub(crate) feed: ChangeFeed,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) session_config: SessionConfig,
    pub(crate) codec: JsonCodec,
}

/// Builder for configuring and starting a flagwatch server.
///
/// # Example
///
/// ```rust,ignore
/// use flagwatch::prelude::*;
///
/// let server = FlagwatchServerBuilder::new()
///     .bind("0.0.0.0:8000")
///     .build(evaluator, relay)
///     .await?;
/// server.run().await
/// ```
pub struct FlagwatchServerBuilder {
    config: ServerConfig,
}

impl FlagwatchServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
        }
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.config.bind_addr = addr.to_string();
        self
    }

    /// Sets the watch timing.
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.config.session = config;
        self
    }

    /// Sets the relay queue and reconnect policy.
    pub fn feed_config(mut self, config: FeedConfig) -> Self {
        self.config.feed = config;
        self
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Binds the listener and starts the change feed.
    ///
    /// # Errors
    /// Returns `FlagwatchError::Io` if the address cannot be bound.
    pub async fn build<E, R>(
        self,
        evaluator: E,
        relay: R,
    ) -> Result<FlagwatchServer<E>, FlagwatchError>
    where
        E: Evaluator,
        R: RelayConnector,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let feed = ChangeFeed::start(relay, self.config.feed.clone());

        let state = Arc::new(ServerState {
            evaluator,
            feed,
            registry: Arc::new(SessionRegistry::new()),
            session_config: self.config.session.clone(),
            codec: JsonCodec,
        });

        Ok(FlagwatchServer {
            listener,
            state,
            shutdown_grace: self.config.shutdown_grace,
        })
    }
}

impl Default for FlagwatchServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound flagwatch server, created by [`FlagwatchServerBuilder`].
///
/// Call [`run()`](Self::run) to start serving.
pub struct FlagwatchServer<E: Evaluator> {
    listener: TcpListener,
    state: Arc<ServerState<E>>,
    shutdown_grace: Duration,
}

impl<E: Evaluator> FlagwatchServer<E> {
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The table of open watches.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.state.registry)
    }

    /// The relay feed shared by every watch.
    pub fn feed(&self) -> ChangeFeed {
        self.state.feed.clone()
    }

    /// Serves until the process is terminated.
    pub async fn run(self) -> Result<(), FlagwatchError> {
        self.run_until(std::future::pending()).await
    }

    /// Serves until `signal` resolves, then shuts down gracefully.
    ///
    /// Shutdown stops accepting, stops the change feed (which ends every
    /// watch with `subscription_closed`), and waits up to the configured
    /// grace period for the watches to close.
    pub async fn run_until<F>(self, signal: F) -> Result<(), FlagwatchError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        tracing::info!(%addr, "flagwatch server running");

        let feed = self.state.feed.clone();
        let registry = Arc::clone(&self.state.registry);
        let app = router(Arc::clone(&self.state));

        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move {
                signal.await;
                tracing::info!("shutdown requested");
                feed.shutdown();
            })
            .await?;

        self.state.feed.shutdown();
        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while !registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(remaining = registry.len(), "shutdown grace period elapsed");
        }

        tracing::info!("flagwatch server stopped");
        Ok(())
    }
}
