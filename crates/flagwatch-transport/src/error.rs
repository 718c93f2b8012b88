/// Errors that can occur in the transport layer.
///
/// Any of these terminates the watch that hit it: the client is expected
/// to reconnect.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection was already closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Receiving data failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),
}
