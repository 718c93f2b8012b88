//! Evaluation client for flagwatch.
//!
//! flagwatch never evaluates flag rules itself. Given a [`FlagQuery`] it
//! asks an external evaluation engine for the current value and returns a
//! fresh [`FlagValue`]. There is no cache here: the one-shot
//! endpoints and the first message of a watch go through the same call and
//! must agree.
//!
//! - [`Evaluator`]: the seam the server is generic over
//! - [`HttpEvaluator`]: talks to the engine over HTTPS with an API key
//! - [`evaluate_with_timeout`]: hard bound around any evaluator
//!
//! [`FlagQuery`]: flagwatch_protocol::FlagQuery
//! [`FlagValue`]: flagwatch_protocol::FlagValue

mod error;
mod evaluator;
mod http;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;

pub use error::EvalError;
pub use evaluator::{Evaluator, evaluate_with_timeout};
pub use http::{HttpEvaluator, HttpEvaluatorConfig};
