//! Server-Sent Events connection to the relay.
//!
//! The relay publishes one JSON payload per SSE frame:
//!
//! ```json
//! {"event": "patch", "domain": "flag", "identifier": "dark-mode", "version": 12}
//! ```
//!
//! `domain` says what changed and `event` how. Frames with empty data and
//! heartbeats carry no change and are skipped.

use std::time::Duration;

use eventsource_stream::{Event, Eventsource};
use flagwatch_protocol::{ChangeEvent, EventKind};
use futures_util::{StreamExt, future};
use reqwest::Url;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use serde::Deserialize;
use serde_json::Value;

use crate::{EventStream, FeedError, RelayConnector};

/// Connects to `GET {events_url}/stream` with the server API key.
pub struct SseRelay {
    client: reqwest::Client,
    url: Url,
    api_key: String,
}

impl SseRelay {
    pub fn new(
        events_url: &str,
        api_key: impl Into<String>,
    ) -> Result<Self, FeedError> {
        let mut url = Url::parse(events_url)
            .map_err(|e| FeedError::InvalidUrl(format!("{events_url}: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| FeedError::InvalidUrl(events_url.to_string()))?
            .pop_if_empty()
            .push("stream");

        // No overall timeout: the response body is open-ended.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(FeedError::Connect)?;

        Ok(Self {
            client,
            url,
            api_key: api_key.into(),
        })
    }

    /// The stream URL this relay connects to.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl RelayConnector for SseRelay {
    async fn connect(&self) -> Result<EventStream, FeedError> {
        tracing::info!(url = %self.url, "connecting to relay stream");

        let response = self
            .client
            .get(self.url.clone())
            .header("API-Key", &self.api_key)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(FeedError::Connect)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let events = response.bytes_stream().eventsource().filter_map(|item| {
            future::ready(match item {
                Ok(event) => parse_relay_event(&event).map(Ok),
                Err(e) => Some(Err(FeedError::Stream(e.to_string()))),
            })
        });
        Ok(events.boxed())
    }
}

#[derive(Deserialize)]
struct RelayPayload {
    #[serde(default)]
    event: String,
    #[serde(default)]
    domain: String,
    #[serde(default)]
    identifier: String,
    #[serde(default)]
    version: Option<u64>,
    #[serde(default)]
    value: Option<Value>,
}

/// Converts one SSE frame into a [`ChangeEvent`].
///
/// Returns `None` for frames that carry no change: empty data, heartbeats,
/// payloads without an identifier, and payloads that fail to parse (logged).
pub fn parse_relay_event(frame: &Event) -> Option<ChangeEvent> {
    if frame.data.trim().is_empty() || frame.event == "heartbeat" {
        return None;
    }

    let raw_payload: Value = match serde_json::from_str(&frame.data) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(data = %frame.data, error = %e, "unparseable relay frame");
            return None;
        }
    };
    let payload = match RelayPayload::deserialize(&raw_payload) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(data = %frame.data, error = %e, "unexpected relay payload");
            return None;
        }
    };
    if payload.event == "heartbeat" {
        return None;
    }
    if payload.identifier.is_empty() {
        tracing::debug!(data = %frame.data, "relay payload without identifier");
        return None;
    }

    let kind = match (payload.domain.as_str(), payload.event.as_str()) {
        ("flag", "delete") => EventKind::FlagDeleted,
        ("flag", "create" | "patch") => EventKind::FlagUpdated,
        ("target" | "segment" | "target-segment", _) => EventKind::TargetUpdated,
        _ => EventKind::Unknown,
    };

    Some(ChangeEvent {
        flag_id: payload.identifier,
        kind,
        version: payload.version,
        value: payload.value,
        raw_payload,
    })
}
