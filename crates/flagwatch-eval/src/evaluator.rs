//! The evaluation seam.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use flagwatch_protocol::{FlagQuery, FlagValue};

use crate::EvalError;

/// Computes the current value of a flag for a target.
///
/// Implementations must perform a fresh evaluation on every call; the
/// engine owns caching and rule propagation.
///
/// # Example
///
/// ```rust
/// use flagwatch_eval::{EvalError, Evaluator};
/// use flagwatch_protocol::{FlagQuery, FlagValue, Variation};
///
/// /// Every flag is off for everyone.
/// struct AlwaysOff;
///
/// impl Evaluator for AlwaysOff {
///     async fn evaluate(
///         &self,
///         query: &FlagQuery,
///     ) -> Result<FlagValue, EvalError> {
///         Ok(FlagValue {
///             flag_id: query.flag_id.clone(),
///             flag_value: Variation::Bool(false),
///             target_id: query.target_id.clone(),
///         })
///     }
/// }
/// ```
pub trait Evaluator: Send + Sync + 'static {
    /// Evaluates `query` against the engine.
    fn evaluate(
        &self,
        query: &FlagQuery,
    ) -> impl Future<Output = Result<FlagValue, EvalError>> + Send;

    /// Drops any engine session and authenticates again.
    fn reauthenticate(
        &self,
    ) -> impl Future<Output = Result<(), EvalError>> + Send {
        async { Ok(()) }
    }
}

impl<E: Evaluator> Evaluator for Arc<E> {
    fn evaluate(
        &self,
        query: &FlagQuery,
    ) -> impl Future<Output = Result<FlagValue, EvalError>> + Send {
        (**self).evaluate(query)
    }

    fn reauthenticate(
        &self,
    ) -> impl Future<Output = Result<(), EvalError>> + Send {
        (**self).reauthenticate()
    }
}

/// Runs `evaluator.evaluate(query)` but gives up after `bound`.
///
/// A watch must never hang on a stuck engine, whatever the evaluator's own
/// timeout policy is.
pub async fn evaluate_with_timeout<E: Evaluator>(
    evaluator: &E,
    query: &FlagQuery,
    bound: Duration,
) -> Result<FlagValue, EvalError> {
    match tokio::time::timeout(bound, evaluator.evaluate(query)).await {
        Ok(result) => result,
        Err(_) => Err(EvalError::Timeout(bound)),
    }
}
