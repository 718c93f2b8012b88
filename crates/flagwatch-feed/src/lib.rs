//! The process-wide change feed.
//!
//! One physical connection to the upstream relay is shared by every watch
//! in the process. The relay loop reads [`ChangeEvent`]s from it and routes
//! each one to the logical subscriptions registered for that flag.
//!
//! # Key types
//!
//! - [`ChangeFeed`]: owns the relay loop and the dispatch table
//! - [`Subscription`]: one watcher's FIFO queue of events for one flag
//! - [`RelayConnector`]: opens the relay stream ([`SseRelay`] in production)
//! - [`FeedConfig`]: queue sizes, backpressure and reconnect policy
//!
//! [`ChangeEvent`]: flagwatch_protocol::ChangeEvent

mod config;
mod error;
mod feed;
mod relay;
mod sse;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{FeedConfig, FeedStatus};
pub use error::FeedError;
pub use feed::{ChangeFeed, Subscription, SubscriptionId};
pub use relay::{EventStream, RelayConnector};
pub use sse::{SseRelay, parse_relay_event};
