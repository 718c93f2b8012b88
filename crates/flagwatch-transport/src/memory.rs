//! In-memory [`Connection`] for driving a watch without a socket.
//!
//! [`pair`] returns the server half (handed to the code under test) and a
//! [`MemoryPeer`] that plays the client. Dropping the peer is a client
//! disconnect; dropping only its receive side makes server sends fail.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};

use crate::{CloseReason, Connection, TransportError};

/// What the server wrote to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Vec<u8>),
    Close(CloseReason),
}

impl Frame {
    /// The payload as UTF-8, if this is a data frame.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Data(data) => std::str::from_utf8(data).ok(),
            Self::Close(_) => None,
        }
    }
}

/// Server half of an in-memory connection.
pub struct MemoryConnection {
    incoming: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    outgoing: mpsc::UnboundedSender<Frame>,
    closed: AtomicBool,
}

/// Client half of an in-memory connection.
pub struct MemoryPeer {
    to_server: Option<mpsc::UnboundedSender<Vec<u8>>>,
    from_server: mpsc::UnboundedReceiver<Frame>,
}

/// Creates a connected server/client pair.
pub fn pair() -> (MemoryConnection, MemoryPeer) {
    let (to_server, incoming) = mpsc::unbounded_channel();
    let (outgoing, from_server) = mpsc::unbounded_channel();
    (
        MemoryConnection {
            incoming: Mutex::new(incoming),
            outgoing,
            closed: AtomicBool::new(false),
        },
        MemoryPeer {
            to_server: Some(to_server),
            from_server,
        },
    )
}

impl MemoryPeer {
    /// Sends a message to the server. Returns `false` once the client has
    /// disconnected or the server dropped its half.
    pub fn send(&self, data: impl Into<Vec<u8>>) -> bool {
        self.to_server
            .as_ref()
            .is_some_and(|tx| tx.send(data.into()).is_ok())
    }

    /// Waits for the next frame written by the server. `None` once the
    /// server half is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_server.recv().await
    }

    /// Closes the client side while keeping the receive side readable.
    pub fn disconnect(&mut self) {
        self.to_server = None;
    }

    /// Drops the receive side so that every further server send fails.
    pub fn stop_reading(&mut self) {
        self.from_server.close();
    }
}

impl Connection for MemoryConnection {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed(
                "closed by server".into(),
            ));
        }
        self.outgoing
            .send(Frame::Data(data.to_vec()))
            .map_err(|_| {
                TransportError::SendFailed(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "peer stopped reading",
                ))
            })
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.incoming.lock().await.recv().await)
    }

    async fn close(&self, reason: CloseReason) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // The peer may already be gone; closing is still complete.
        let _ = self.outgoing.send(Frame::Close(reason));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let (server, mut client) = pair();

        assert!(client.send("hello"));
        let got = server.recv().await.unwrap().unwrap();
        assert_eq!(got, b"hello");

        server.send(b"world").await.unwrap();
        let frame = client.recv().await.unwrap();
        assert_eq!(frame.text(), Some("world"));
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_disconnect() {
        let (server, mut client) = pair();
        client.disconnect();
        assert!(server.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_fails_when_peer_stops_reading() {
        let (server, mut client) = pair();
        client.stop_reading();
        assert!(server.send(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_sends() {
        let (server, mut client) = pair();
        server.close(CloseReason::normal("bye")).await.unwrap();
        server.close(CloseReason::normal("again")).await.unwrap();

        assert_eq!(
            client.recv().await,
            Some(Frame::Close(CloseReason::normal("bye")))
        );
        assert!(matches!(
            server.send(b"late").await,
            Err(TransportError::ConnectionClosed(_))
        ));
    }
}
