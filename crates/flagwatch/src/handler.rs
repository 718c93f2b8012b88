//! Per-connection watch handler.
//!
//! Each accepted watch gets its own Tokio task running this handler.
//! The flow is:
//!   1. Receive the setup message → resolve the `FlagQuery`
//!   2. Register the session and subscribe to the flag's changes
//!   3. Evaluate and send the `initial` message → session is Active
//!   4. Loop: forward changes, send pings, ignore client messages
//!   5. Close on disconnect, relay loss, send failure or the lifetime cap
//!
//! Subscribing before the initial evaluation means a change that lands
//! while the evaluation is in flight is queued and forwarded right after
//! the initial message instead of being lost.
//!
//! Every send after setup races the lifetime deadline, so a client that
//! stops reading cannot keep a watch open past the cap.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flagwatch_eval::{EvalError, Evaluator, evaluate_with_timeout};
use flagwatch_feed::{FeedError, Subscription};
use flagwatch_protocol::{
    ChangeEvent, Codec, ConnectionId, ErrorCode, FlagQuery, FlagRequest,
    FlagValue, Variation, WatchMessage,
};
use flagwatch_session::{ConnectionSession, SessionRegistry, SessionState};
use flagwatch_transport::{CloseReason, Connection};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, Span};

use crate::FlagwatchError;
use crate::server::ServerState;

/// Bound on the closing diagnostic and close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How a watch ended.
#[derive(Debug)]
enum Exit {
    /// The client closed the socket.
    ClientClosed,
    /// The lifetime cap fired.
    TimedOut,
    /// A diagnostic is owed to the client before closing.
    Failed { code: ErrorCode, message: String },
    /// The socket broke; nothing more can be sent.
    Transport(FlagwatchError),
}

impl Exit {
    fn failed(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Failed {
            code,
            message: message.into(),
        }
    }
}

/// Drop guard that removes the session from the registry when the
/// handler exits, including by panic.
struct RegistrationGuard {
    registry: Arc<SessionRegistry>,
    connection_id: ConnectionId,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.connection_id);
    }
}

/// Handles a single watch from accept to close.
pub(crate) async fn handle_watch<C, E>(
    conn: C,
    flag_id: String,
    target_id: String,
    state: Arc<ServerState<E>>,
) where
    C: Connection,
    E: Evaluator,
{
    let connection_id = ConnectionId::generate();
    // The id is recorded once final: registration may replace it.
    let span = tracing::info_span!(
        "watch",
        connection_id = tracing::field::Empty,
        flag_id = %flag_id,
        target_id = %target_id,
    );

    async move {
        tracing::info!("watch connection accepted");
        let mut watch = Watch {
            conn,
            state,
            connection_id,
            accepted_at: Instant::now(),
            registration: None,
        };
        let exit = watch.run(&flag_id, &target_id).await;
        watch.finish(exit).await;
        // Dropping `watch` releases the registration.
    }
    .instrument(span)
    .await
}

struct Watch<C, E: Evaluator> {
    conn: C,
    state: Arc<ServerState<E>>,
    connection_id: ConnectionId,
    accepted_at: Instant,
    registration: Option<RegistrationGuard>,
}

impl<C: Connection, E: Evaluator> Watch<C, E> {
    fn deadline(&self) -> Instant {
        self.accepted_at + self.state.session_config.max_lifetime
    }

    async fn run(&mut self, flag_id: &str, target_id: &str) -> Exit {
        // --- Step 1: Setup ---
        let query = match self.receive_setup(flag_id, target_id).await {
            Ok(query) => query,
            Err(exit) => return exit,
        };

        // --- Step 2: Register and subscribe ---
        let session = ConnectionSession::new(
            self.connection_id,
            query.clone(),
            Utc::now(),
            self.accepted_at,
        );
        let registered = self.state.registry.register(session);
        if registered != self.connection_id {
            tracing::warn!(%registered, "connection id reassigned");
            self.connection_id = registered;
        }
        Span::current().record("connection_id", tracing::field::display(self.connection_id));
        self.registration = Some(RegistrationGuard {
            registry: Arc::clone(&self.state.registry),
            connection_id: self.connection_id,
        });

        let mut subscription = self.state.feed.subscribe(&query.flag_id);
        if let Err(e) = self
            .state
            .registry
            .attach(&self.connection_id, subscription.id())
        {
            tracing::error!(error = %e, "failed to attach subscription");
        }

        // --- Step 3: Initial value ---
        let deadline = self.deadline();
        let initial = match tokio::time::timeout_at(deadline, self.evaluate(&query)).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => return self.close_with(e.code(), e.to_string()),
            Err(_) => return self.closing(Exit::TimedOut),
        };
        tracing::info!(flag_value = %initial.flag_value, "starting watch on feature flag");
        let message = WatchMessage::initial(self.connection_id, &query, initial.clone());
        if let Err(exit) = self.send_before(&message, deadline).await {
            return self.closing(exit);
        }
        if let Err(e) = self
            .state
            .registry
            .transition(&self.connection_id, SessionState::Active)
        {
            tracing::error!(error = %e, "failed to activate session");
        }

        // --- Step 4: Forward changes ---
        let exit = self
            .forward_changes(&query, &mut subscription, initial.flag_value)
            .await;
        self.closing(exit)
    }

    /// Waits for the first client message and resolves it against the
    /// path.
    async fn receive_setup(
        &self,
        flag_id: &str,
        target_id: &str,
    ) -> Result<FlagQuery, Exit> {
        let setup_deadline = (self.accepted_at
            + self.state.session_config.setup_timeout)
            .min(self.deadline());

        let data = match tokio::time::timeout_at(setup_deadline, self.conn.recv()).await {
            Ok(Ok(Some(data))) => data,
            Ok(Ok(None)) => {
                tracing::info!("client closed before setup");
                return Err(Exit::ClientClosed);
            }
            Ok(Err(e)) => return Err(Exit::Transport(e.into())),
            Err(_) if setup_deadline >= self.deadline() => return Err(Exit::TimedOut),
            Err(_) => {
                return Err(Exit::failed(
                    ErrorCode::BadRequest,
                    "no setup message received",
                ));
            }
        };

        let request: FlagRequest = if data.iter().all(u8::is_ascii_whitespace) {
            FlagRequest::default()
        } else {
            self.state
                .codec
                .decode(&data)
                .map_err(|e| Exit::failed(ErrorCode::BadRequest, e.to_string()))?
        };

        FlagQuery::from_request(flag_id, target_id, request)
            .map_err(|e| Exit::failed(ErrorCode::BadRequest, e.to_string()))
    }

    async fn forward_changes(
        &self,
        query: &FlagQuery,
        subscription: &mut Subscription,
        mut current: Variation,
    ) -> Exit {
        let deadline = self.deadline();
        let ping_period = self.state.session_config.ping_interval;
        let pings_enabled = !ping_period.is_zero();
        let ping_period = ping_period.max(Duration::from_millis(1));
        let mut ping = tokio::time::interval_at(Instant::now() + ping_period, ping_period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!("closing watch, lifetime cap reached");
                    return Exit::TimedOut;
                }

                event = subscription.recv() => {
                    let event = match event {
                        Ok(event) => event,
                        Err(e) => return feed_exit(e),
                    };
                    let next = match tokio::time::timeout_at(
                        deadline,
                        self.next_value(query, &event),
                    )
                    .await
                    {
                        Ok(next) => next,
                        Err(_) => return Exit::TimedOut,
                    };
                    let value = match next {
                        Ok(value) => value,
                        Err(e) => {
                            tracing::warn!(
                                error = %e,
                                event = ?event.kind,
                                "re-evaluation failed, change dropped"
                            );
                            continue;
                        }
                    };

                    tracing::info!(
                        flag_value = %value.flag_value,
                        previous_flag_value = %current,
                        event = ?event.kind,
                        "sending update to watched feature flag"
                    );
                    let previous = std::mem::replace(&mut current, value.flag_value.clone());
                    let message = WatchMessage::update(
                        self.connection_id,
                        query,
                        value,
                        Some(previous),
                        event.kind,
                    );
                    if let Err(exit) = self.send_before(&message, deadline).await {
                        return exit;
                    }
                }

                frame = self.conn.recv() => match frame {
                    Ok(Some(_)) => {
                        tracing::debug!("ignoring client message after setup");
                    }
                    Ok(None) => {
                        tracing::info!("closing connection to watched feature flag");
                        return Exit::ClientClosed;
                    }
                    Err(e) => return Exit::Transport(e.into()),
                },

                _ = ping.tick(), if pings_enabled => {
                    tracing::debug!("sending keep-alive ping");
                    if let Err(exit) = self.send_before(&WatchMessage::Ping, deadline).await {
                        return exit;
                    }
                }
            }
        }
    }

    /// The value to forward for `event`: the embedded value when it fits
    /// the watched variation type, otherwise a fresh evaluation.
    async fn next_value(
        &self,
        query: &FlagQuery,
        event: &ChangeEvent,
    ) -> Result<FlagValue, EvalError> {
        if let Some(raw) = &event.value {
            match Variation::coerce(query.variation_type, raw) {
                Ok(flag_value) => {
                    return Ok(FlagValue {
                        flag_id: query.flag_id.clone(),
                        flag_value,
                        target_id: query.target_id.clone(),
                    });
                }
                Err(e) => {
                    tracing::debug!(error = %e, "embedded value unusable, re-evaluating");
                }
            }
        }
        self.evaluate(query).await
    }

    async fn evaluate(&self, query: &FlagQuery) -> Result<FlagValue, EvalError> {
        evaluate_with_timeout(
            &self.state.evaluator,
            query,
            self.state.session_config.evaluation_timeout,
        )
        .await
    }

    async fn send(&self, message: &WatchMessage) -> Result<(), FlagwatchError> {
        let bytes = self.state.codec.encode(message)?;
        self.conn.send(&bytes).await?;
        Ok(())
    }

    /// Sends `message`, giving up at `deadline`.
    async fn send_before(&self, message: &WatchMessage, deadline: Instant) -> Result<(), Exit> {
        match tokio::time::timeout_at(deadline, self.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Exit::Transport(e)),
            Err(_) => {
                tracing::warn!("closing watch, lifetime cap reached during send");
                Err(Exit::TimedOut)
            }
        }
    }

    fn close_with(&self, code: ErrorCode, message: String) -> Exit {
        self.closing(Exit::Failed { code, message })
    }

    /// Marks the session Closing. Safe to call more than once.
    fn closing(&self, exit: Exit) -> Exit {
        if let Err(e) = self
            .state
            .registry
            .transition(&self.connection_id, SessionState::Closing)
        {
            tracing::debug!(error = %e, "session not closable");
        }
        exit
    }

    /// Sends the owed diagnostic, if any, then closes the socket. Each
    /// step is bounded by [`CLOSE_TIMEOUT`].
    async fn finish(&self, exit: Exit) {
        if self.registration.is_none() {
            Span::current().record("connection_id", tracing::field::display(self.connection_id));
        }
        let reason = match &exit {
            Exit::ClientClosed => CloseReason::normal("client closed"),
            Exit::TimedOut => CloseReason::normal("timed out"),
            Exit::Failed { code, message } => {
                tracing::warn!(?code, %message, "watch failed");
                let diagnostic =
                    WatchMessage::error(Some(self.connection_id), *code, message.clone());
                match tokio::time::timeout(CLOSE_TIMEOUT, self.send(&diagnostic)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::debug!(error = %e, "could not deliver diagnostic"),
                    Err(_) => tracing::debug!("diagnostic send timed out"),
                }
                close_reason(*code)
            }
            Exit::Transport(e) => {
                tracing::info!(error = %e, "watch transport failed");
                CloseReason::error("transport error")
            }
        };

        match tokio::time::timeout(CLOSE_TIMEOUT, self.conn.close(reason)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "close failed"),
            Err(_) => tracing::debug!("close timed out"),
        }
        tracing::info!(?exit, "watch closed");
    }
}

fn feed_exit(e: FeedError) -> Exit {
    Exit::failed(e.code(), e.to_string())
}

fn close_reason(code: ErrorCode) -> CloseReason {
    match code {
        ErrorCode::BadRequest => CloseReason::policy("bad request"),
        ErrorCode::FlagNotFound => CloseReason::policy("flag not found"),
        ErrorCode::TargetNotFound => CloseReason::policy("target not found"),
        ErrorCode::EvaluationTimeout => CloseReason::error("evaluation timed out"),
        ErrorCode::EvaluationFailed => CloseReason::error("evaluation failed"),
        ErrorCode::RelayUnavailable => CloseReason::error("relay unavailable"),
        ErrorCode::SubscriptionClosed => CloseReason::error("subscription closed"),
        ErrorCode::ConnectionNotFound | ErrorCode::Internal => {
            CloseReason::error("internal error")
        }
    }
}

// =========================================================================
// Tests
// =========================================================================
