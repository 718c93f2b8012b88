//! Data model and wire protocol for flagwatch.
//!
//! This crate defines what the service and its clients say to each other:
//!
//! - **Types** ([`FlagQuery`], [`FlagValue`], [`ChangeEvent`],
//!   [`WatchMessage`], etc.): the structures that travel on the wire or
//!   between the components of a watch.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how those messages
//!   are converted to/from bytes.
//! - **Errors** ([`ProtocolError`]): malformed or invalid payloads. Every
//!   variant except `Encode` is a client error (HTTP 400 / watch
//!   `bad_request`).
//!
//! The protocol layer knows nothing about sockets, the evaluation engine or
//! the relay. It only validates and (de)serializes.
//!
//! ```text
//! Transport (frames) → Protocol (FlagRequest / WatchMessage) → Session
//! ```

mod codec;
mod error;
mod types;

pub use codec::{Codec, JsonCodec};
pub use error::ProtocolError;
pub use types::{
    ChangeEvent, ConnectionId, ErrorCode, EventKind, FlagQuery, FlagRequest,
    FlagValue, Variation, VariationType, WatchMessage,
};
