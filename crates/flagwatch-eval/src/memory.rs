//! In-memory [`Evaluator`] for tests.
//!
//! Holds one raw value per flag, optionally overridden per target, and
//! coerces it to the requested variation type like the engine would.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use flagwatch_protocol::{FlagQuery, FlagValue, Variation};
use serde_json::Value;

use crate::{EvalError, Evaluator};

#[derive(Default)]
struct Flags {
    defaults: HashMap<String, Value>,
    per_target: HashMap<(String, String), Value>,
}

/// A scriptable evaluator.
#[derive(Default)]
pub struct MemoryEvaluator {
    flags: RwLock<Flags>,
    calls: AtomicUsize,
    reauths: AtomicUsize,
    delay: Option<Duration>,
}

impl MemoryEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every evaluation sleeps for `delay` first.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sets the value of `flag_id` for every target without an override.
    pub fn set(&self, flag_id: &str, value: Value) {
        self.write().defaults.insert(flag_id.to_string(), value);
    }

    /// Sets the value of `flag_id` for one target.
    pub fn set_for_target(&self, flag_id: &str, target_id: &str, value: Value) {
        self.write()
            .per_target
            .insert((flag_id.to_string(), target_id.to_string()), value);
    }

    /// Forgets a flag; later evaluations fail with `FlagNotFound`.
    pub fn remove(&self, flag_id: &str) {
        let mut flags = self.write();
        flags.defaults.remove(flag_id);
        flags.per_target.retain(|(flag, _), _| flag != flag_id);
    }

    /// Number of `evaluate` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of `reauthenticate` calls so far.
    pub fn reauthentications(&self) -> usize {
        self.reauths.load(Ordering::SeqCst)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Flags> {
        self.flags.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, query: &FlagQuery) -> Option<Value> {
        let flags = self.flags.read().unwrap_or_else(|e| e.into_inner());
        flags
            .per_target
            .get(&(query.flag_id.clone(), query.target_id.clone()))
            .or_else(|| flags.defaults.get(&query.flag_id))
            .cloned()
    }
}

impl Evaluator for MemoryEvaluator {
    async fn evaluate(&self, query: &FlagQuery) -> Result<FlagValue, EvalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let raw = self
            .lookup(query)
            .ok_or_else(|| EvalError::FlagNotFound(query.flag_id.clone()))?;
        Ok(FlagValue {
            flag_id: query.flag_id.clone(),
            flag_value: Variation::coerce(query.variation_type, &raw)?,
            target_id: query.target_id.clone(),
        })
    }

    async fn reauthenticate(&self) -> Result<(), EvalError> {
        self.reauths.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
