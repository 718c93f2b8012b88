//! A scripted relay for tests.
//!
//! Each call to `connect` consumes the next step of the script: either a
//! failure or a stream fed through a [`RelayStream`] handle. With the
//! script exhausted, `connect` never completes, like a relay that does not
//! answer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use flagwatch_protocol::{ChangeEvent, EventKind};
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::{EventStream, FeedError, RelayConnector};

type Item = Result<ChangeEvent, FeedError>;

enum Step {
    Fail,
    Stream(mpsc::UnboundedReceiver<Item>),
}

/// A [`RelayConnector`] driven by the test.
#[derive(Clone, Default)]
pub struct ScriptedRelay {
    steps: Arc<Mutex<VecDeque<Step>>>,
    attempts: Arc<AtomicUsize>,
}

impl ScriptedRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` connection attempts fail.
    pub fn fail_next(&self, n: usize) {
        let mut steps = self.lock();
        for _ in 0..n {
            steps.push_back(Step::Fail);
        }
    }

    /// The next connection attempt succeeds with a stream fed through the
    /// returned handle. Dropping the handle ends the stream.
    pub fn push_stream(&self) -> RelayStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push_back(Step::Stream(rx));
        RelayStream { tx }
    }

    /// Number of `connect` calls so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Step>> {
        self.steps.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RelayConnector for ScriptedRelay {
    async fn connect(&self) -> Result<EventStream, FeedError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let step = self.lock().pop_front();
        match step {
            Some(Step::Fail) => Err(FeedError::Stream("scripted failure".into())),
            Some(Step::Stream(rx)) => Ok(futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed()),
            None => std::future::pending().await,
        }
    }
}

/// Feeds events into one scripted relay connection.
pub struct RelayStream {
    tx: mpsc::UnboundedSender<Item>,
}

impl RelayStream {
    /// Emits an event. Returns `false` once the feed stopped reading.
    pub fn send(&self, event: ChangeEvent) -> bool {
        self.tx.send(Ok(event)).is_ok()
    }

    /// Breaks the stream with an error.
    pub fn fail(self, message: &str) {
        let _ = self.tx.send(Err(FeedError::Stream(message.to_string())));
    }
}

/// Builds a relay event for `flag_id`, optionally carrying a value.
pub fn flag_event(flag_id: &str, kind: EventKind, value: Option<Value>) -> ChangeEvent {
    let event = match kind {
        EventKind::FlagDeleted => "delete",
        _ => "patch",
    };
    let mut raw_payload = json!({"event": event, "domain": "flag", "identifier": flag_id});
    if let Some(v) = &value {
        raw_payload["value"] = v.clone();
    }
    ChangeEvent {
        flag_id: flag_id.to_string(),
        kind,
        version: None,
        value,
        raw_payload,
    }
}
