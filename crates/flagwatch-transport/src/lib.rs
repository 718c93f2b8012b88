//! Transport abstraction layer for flagwatch.
//!
//! A watch session never touches a socket type directly. It talks to a
//! [`Connection`]: frames in, frames out, close. This crate provides the
//! WebSocket implementation used by the server and an in-memory one for
//! tests.
//!
//! # Feature Flags
//!
//! - `websocket` (default): [`WebSocketConnection`] over axum's WebSocket
//! - `test-util`: [`memory::pair`], an in-memory connection and its peer

mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;

use std::borrow::Cow;
use std::future::Future;

/// Why the server is closing a connection. Becomes the WebSocket close
/// frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// WebSocket close code (RFC 6455 §7.4).
    pub code: u16,
    /// Human-readable reason, at most 123 bytes on the wire.
    pub reason: Cow<'static, str>,
}

impl CloseReason {
    /// 1000: the watch ended normally (including the lifetime cap).
    pub const NORMAL: u16 = 1000;
    /// 1008: the client sent something the server won't accept.
    pub const POLICY: u16 = 1008;
    /// 1011: the server could not keep serving the watch.
    pub const ERROR: u16 = 1011;

    pub fn normal(reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: Self::NORMAL,
            reason: reason.into(),
        }
    }

    pub fn policy(reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: Self::POLICY,
            reason: reason.into(),
        }
    }

    pub fn error(reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: Self::ERROR,
            reason: reason.into(),
        }
    }
}

/// A single duplex connection to a watch client.
///
/// Methods take `&self` so a session can wait on [`recv`](Self::recv)
/// inside a `select!` while other branches [`send`](Self::send);
/// implementations keep their read and write halves independently locked.
pub trait Connection: Send + Sync + 'static {
    /// Sends one message to the client.
    fn send(
        &self,
        data: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receives the next message from the client.
    ///
    /// Returns `Ok(None)` when the client closed the connection. Control
    /// frames (ping/pong) are consumed internally and never returned.
    fn recv(
        &self,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send;

    /// Closes the connection from the server side.
    fn close(
        &self,
        reason: CloseReason,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_constructors() {
        assert_eq!(CloseReason::normal("timed out").code, 1000);
        assert_eq!(CloseReason::policy("bad").code, 1008);
        assert_eq!(CloseReason::error("relay").code, 1011);
        assert_eq!(CloseReason::normal("timed out").reason, "timed out");
    }

    #[test]
    fn test_close_reason_accepts_owned_strings() {
        let reason = CloseReason::error(format!("code {}", 7));
        assert_eq!(reason.reason, "code 7");
    }
}
