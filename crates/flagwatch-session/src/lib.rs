//! Connection records for flagwatch watches.
//!
//! This crate tracks every open watch:
//!
//! 1. **State machine**: where a watch is in its life ([`SessionState`])
//! 2. **Record**: what it watches and since when ([`ConnectionSession`])
//! 3. **Registry**: the process-wide table of open watches
//!    ([`SessionRegistry`]), used for diagnostics and log correlation
//!
//! # How it fits in the stack
//!
//! ```text
//! Watch handler (above)  ← registers, transitions and removes sessions
//!     ↕
//! Session Layer (this crate)
//!     ↕
//! Protocol / Feed (below)  ← ConnectionId, FlagQuery, SubscriptionId
//! ```

mod error;
mod registry;
mod session;

pub use error::SessionError;
pub use registry::SessionRegistry;
pub use session::{ConnectionSession, SessionConfig, SessionState};
