//! Relay loop and dispatch table.
//!
//! ```text
//!                     ┌──────────────┐  flag "a"  ┌────────────────┐
//!  relay ──stream──▶  │  relay loop  │ ─────────▶ │ Subscription 1 │
//!                     │  (one task)  │ ─────┐     └────────────────┘
//!                     └──────────────┘      │     ┌────────────────┐
//!                                           └───▶ │ Subscription 2 │
//!                                                 └────────────────┘
//! ```
//!
//! The loop dispatches events one at a time, so every subscription sees
//! events in relay order. A subscription whose queue stays full for longer
//! than `send_timeout` is detached rather than allowed to stall the others.
//!
//! Outages are announced on a separate `watch` channel, not on the queues.
//! Each announcement bumps an epoch; a subscription only ends if it was
//! attached before the epoch it observes, so watches taken during an
//! outage wait for the relay to come back.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use flagwatch_protocol::ChangeEvent;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::SendTimeoutError;

use crate::{FeedConfig, FeedError, FeedStatus, RelayConnector};

/// Identifies one logical subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// The latest outage announcement.
#[derive(Debug, Clone, Copy, Default)]
struct Outage {
    /// Bumped once per exhausted retry budget.
    epoch: u64,
    attempts: u32,
}

type Routes = HashMap<String, HashMap<SubscriptionId, mpsc::Sender<ChangeEvent>>>;

struct Shared {
    config: FeedConfig,
    routes: RwLock<Routes>,
    next_id: AtomicU64,
    status: watch::Sender<FeedStatus>,
    outage: watch::Sender<Outage>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn read_routes(&self) -> RwLockReadGuard<'_, Routes> {
        self.routes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_routes(&self) -> RwLockWriteGuard<'_, Routes> {
        self.routes.write().unwrap_or_else(|e| e.into_inner())
    }

    fn detach(&self, flag_id: &str, id: SubscriptionId) -> bool {
        let mut routes = self.write_routes();
        let Some(subs) = routes.get_mut(flag_id) else {
            return false;
        };
        let removed = subs.remove(&id).is_some();
        if subs.is_empty() {
            routes.remove(flag_id);
        }
        removed
    }

    fn set_status(&self, status: FeedStatus) {
        self.status.send_if_modified(|current| {
            if *current == status || *current == FeedStatus::Stopped {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    /// Delivers `event` to every subscription for its flag, in
    /// subscription order.
    async fn dispatch(&self, event: ChangeEvent) {
        let targets: Vec<(SubscriptionId, mpsc::Sender<ChangeEvent>)> = {
            let routes = self.read_routes();
            match routes.get(&event.flag_id) {
                Some(subs) => {
                    let mut targets: Vec<_> =
                        subs.iter().map(|(id, tx)| (*id, tx.clone())).collect();
                    targets.sort_by_key(|(id, _)| *id);
                    targets
                }
                None => return,
            }
        };

        tracing::debug!(
            flag_id = %event.flag_id,
            kind = ?event.kind,
            subscribers = targets.len(),
            "dispatching change event"
        );

        for (id, tx) in targets {
            match tx.send_timeout(event.clone(), self.config.send_timeout).await {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    tracing::warn!(
                        flag_id = %event.flag_id,
                        subscription = %id,
                        "subscriber queue full, detaching"
                    );
                    self.detach(&event.flag_id, id);
                }
                Err(SendTimeoutError::Closed(_)) => {
                    self.detach(&event.flag_id, id);
                }
            }
        }
    }

    /// Ends every attached subscription with `RelayUnavailable` and
    /// detaches them. Subscriptions taken afterwards are unaffected.
    fn report_unavailable(&self, attempts: u32) {
        let mut routes = self.write_routes();
        let released: usize = routes.values().map(HashMap::len).sum();
        // Epoch first: a subscriber that sees its queue close must already
        // find the announcement.
        self.outage.send_modify(|outage| {
            outage.epoch += 1;
            outage.attempts = attempts;
        });
        routes.clear();
        drop(routes);
        tracing::error!(attempts, released, "relay unavailable, subscriptions released");
    }
}

/// Handle to the process-wide change feed.
///
/// Cheap to clone. Every clone talks to the same relay loop.
#[derive(Clone)]
pub struct ChangeFeed {
    shared: Arc<Shared>,
}

impl ChangeFeed {
    /// Spawns the relay loop on the current Tokio runtime.
    ///
    /// Returns immediately; the first connection attempt happens in the
    /// background.
    pub fn start<C: RelayConnector>(connector: C, config: FeedConfig) -> Self {
        let (status, _) = watch::channel(FeedStatus::Connecting);
        let (outage, _) = watch::channel(Outage::default());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            routes: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            status,
            outage,
            shutdown,
        });

        tokio::spawn(run_relay_loop(connector, Arc::clone(&shared), shutdown_rx));

        Self { shared }
    }

    /// Attaches a logical subscription for `flag_id`.
    ///
    /// Always succeeds, whatever the relay's health. Events start flowing
    /// once the relay stream is up.
    pub fn subscribe(&self, flag_id: impl Into<String>) -> Subscription {
        let flag_id = flag_id.into();
        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.shared.config.queue_capacity.max(1));

        let epoch = {
            let mut routes = self.shared.write_routes();
            routes.entry(flag_id.clone()).or_default().insert(id, tx);
            self.shared.outage.borrow().epoch
        };
        tracing::debug!(%flag_id, subscription = %id, "subscribed");

        Subscription {
            id,
            flag_id,
            receiver: rx,
            outage: self.shared.outage.subscribe(),
            epoch,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Detaches `subscription`. Equivalent to dropping it.
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// Current relay status.
    pub fn status(&self) -> FeedStatus {
        *self.shared.status.borrow()
    }

    /// A receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<FeedStatus> {
        self.shared.status.subscribe()
    }

    /// Number of attached subscriptions across all flags.
    pub fn subscriber_count(&self) -> usize {
        self.shared.read_routes().values().map(HashMap::len).sum()
    }

    /// Stops the relay loop and closes every subscription.
    pub fn shutdown(&self) {
        let _ = self.shared.shutdown.send(true);
        self.shared.write_routes().clear();
        self.shared.set_status(FeedStatus::Stopped);
    }
}

/// One watcher's view of the feed: the events for a single flag, in relay
/// order.
///
/// Dropping the subscription detaches it from the dispatch table.
pub struct Subscription {
    id: SubscriptionId,
    flag_id: String,
    receiver: mpsc::Receiver<ChangeEvent>,
    outage: watch::Receiver<Outage>,
    /// Outage epoch at subscribe time.
    epoch: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Waits for the next change.
    ///
    /// Fails with [`FeedError::RelayUnavailable`] once the relay has
    /// exhausted its retry budget after this subscription was taken, even
    /// if its queue is full. Fails with [`FeedError::SubscriptionClosed`]
    /// when the queue was closed because the subscription fell too far
    /// behind or the feed shut down. Both are terminal.
    pub async fn recv(&mut self) -> Result<ChangeEvent, FeedError> {
        let epoch = self.epoch;
        let next = tokio::select! {
            biased;
            Ok(attempts) = outage_after(&mut self.outage, epoch) => Err(attempts),
            event = self.receiver.recv() => Ok(event),
        };

        match next {
            Ok(Some(event)) => Ok(event),
            Ok(None) => match self.announced_outage() {
                Some(attempts) => Err(FeedError::RelayUnavailable(attempts)),
                None => Err(FeedError::SubscriptionClosed),
            },
            Err(attempts) => {
                self.receiver.close();
                Err(FeedError::RelayUnavailable(attempts))
            }
        }
    }

    fn announced_outage(&self) -> Option<u32> {
        let outage = *self.outage.borrow();
        (outage.epoch > self.epoch).then_some(outage.attempts)
    }
}

async fn outage_after(
    outage: &mut watch::Receiver<Outage>,
    epoch: u64,
) -> Result<u32, watch::error::RecvError> {
    outage
        .wait_for(|o| o.epoch > epoch)
        .await
        .map(|o| o.attempts)
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("flag_id", &self.flag_id)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            if shared.detach(&self.flag_id, self.id) {
                tracing::debug!(flag_id = %self.flag_id, subscription = %self.id, "unsubscribed");
            }
        }
    }
}

/// Connects, pumps events, and reconnects with backoff until shut down.
async fn run_relay_loop<C: RelayConnector>(
    connector: C,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut budget = RetryBudget::default();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let outcome = tokio::select! {
            _ = shutdown.changed() => break,
            outcome = pump(&connector, &shared, &mut budget) => outcome,
        };

        match outcome {
            Ok(()) => tracing::info!("relay stream ended"),
            Err(e) => {
                budget.failures = budget.failures.saturating_add(1);
                tracing::warn!(error = %e, failures = budget.failures, "relay connection failed");
            }
        }

        let max = shared.config.max_retries;
        if max > 0 && budget.failures >= max {
            // Once per outage; later subscriptions wait for a reconnect.
            if !budget.reported {
                shared.set_status(FeedStatus::Unavailable);
                shared.report_unavailable(budget.failures);
                budget.reported = true;
            }
        } else if *shared.status.borrow() != FeedStatus::Unavailable {
            shared.set_status(FeedStatus::Connecting);
        }

        let delay = shared.config.backoff_with_jitter(budget.failures);
        tracing::debug!(delay_ms = delay.as_millis() as u64, "reconnecting to relay");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    shared.set_status(FeedStatus::Stopped);
    tracing::info!("relay loop stopped");
}

/// Consecutive connection failures, and whether this outage was announced.
#[derive(Debug, Default)]
struct RetryBudget {
    failures: u32,
    reported: bool,
}

/// One connection: open the stream, then dispatch until it ends.
async fn pump<C: RelayConnector>(
    connector: &C,
    shared: &Shared,
    budget: &mut RetryBudget,
) -> Result<(), FeedError> {
    let mut stream = connector.connect().await?;
    *budget = RetryBudget::default();
    shared.set_status(FeedStatus::Connected);
    tracing::info!("relay stream established");

    while let Some(item) = stream.next().await {
        shared.dispatch(item?).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{ScriptedRelay, flag_event};
    use flagwatch_protocol::EventKind;

    fn quick_config() -> FeedConfig {
        FeedConfig {
            reconnect_base_delay: Duration::from_millis(10),
            reconnect_max_delay: Duration::from_millis(40),
            jitter: Duration::ZERO,
            ..Default::default()
        }
    }

    async fn wait_for(feed: &ChangeFeed, status: FeedStatus) {
        let mut rx = feed.watch_status();
        rx.wait_for(|s| *s == status).await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_routes_only_matching_flag() {
        let relay = ScriptedRelay::new();
        let stream = relay.push_stream();
        let feed = ChangeFeed::start(relay, quick_config());

        let mut a = feed.subscribe("a");
        let mut b = feed.subscribe("b");
        wait_for(&feed, FeedStatus::Connected).await;

        stream.send(flag_event("b", EventKind::FlagUpdated, None));
        stream.send(flag_event("a", EventKind::FlagUpdated, None));

        assert_eq!(a.recv().await.unwrap().flag_id, "a");
        assert_eq!(b.recv().await.unwrap().flag_id, "b");
        feed.shutdown();
    }

    #[tokio::test]
    async fn test_drop_subscription_detaches() {
        let feed = ChangeFeed::start(ScriptedRelay::new(), quick_config());
        let sub = feed.subscribe("a");
        let other = feed.subscribe("a");
        assert_eq!(feed.subscriber_count(), 2);

        feed.unsubscribe(sub);
        assert_eq!(feed.subscriber_count(), 1);
        drop(other);
        assert_eq!(feed.subscriber_count(), 0);
        feed.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_detaches_slow_subscriber() {
        let relay = ScriptedRelay::new();
        let stream = relay.push_stream();
        let feed = ChangeFeed::start(
            relay,
            FeedConfig {
                queue_capacity: 1,
                send_timeout: Duration::from_millis(100),
                ..quick_config()
            },
        );
        let mut slow = feed.subscribe("a");
        wait_for(&feed, FeedStatus::Connected).await;

        stream.send(flag_event("a", EventKind::FlagUpdated, None));
        stream.send(flag_event("a", EventKind::FlagDeleted, None));
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(feed.subscriber_count(), 0);
        assert_eq!(slow.recv().await.unwrap().kind, EventKind::FlagUpdated);
        assert!(matches!(slow.recv().await, Err(FeedError::SubscriptionClosed)));
        feed.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_closes_subscriptions() {
        let feed = ChangeFeed::start(ScriptedRelay::new(), quick_config());
        let mut sub = feed.subscribe("a");
        feed.shutdown();

        assert!(matches!(sub.recv().await, Err(FeedError::SubscriptionClosed)));
        assert_eq!(feed.status(), FeedStatus::Stopped);
    }
}
