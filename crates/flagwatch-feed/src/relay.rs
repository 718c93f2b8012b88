//! The relay connection seam.

use std::future::Future;

use flagwatch_protocol::ChangeEvent;
use futures_util::stream::BoxStream;

use crate::FeedError;

/// A live stream of relay events. Ends when the relay closes the stream;
/// yields `Err` when it breaks.
pub type EventStream = BoxStream<'static, Result<ChangeEvent, FeedError>>;

/// Opens the physical connection to the upstream relay.
///
/// [`ChangeFeed`](crate::ChangeFeed) calls `connect` again after every
/// dropped stream, so an implementation must be reusable.
pub trait RelayConnector: Send + Sync + 'static {
    fn connect(
        &self,
    ) -> impl Future<Output = Result<EventStream, FeedError>> + Send;
}
