//! Core protocol types.
//!
//! Everything in this module either travels on the wire (requests,
//! responses, watch messages) or flows between the components of a watch
//! (queries, change events).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Opaque identifier for one watch connection.
///
/// Generated when the socket is accepted and attached to every log line of
/// that connection. It is a correlation token only and must never be used
/// to make a trust decision.
///
/// Serialized as the hyphenated UUID string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generates a fresh random (v4) connection id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for ConnectionId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ProtocolError::InvalidConnectionId(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Variations
// ---------------------------------------------------------------------------

/// The declared type of a flag's value.
///
/// Requests spell these `"string"`, `"boolean"` (or `"bool"`), `"number"`
/// (or `"int"`) and `"json"`. The canonical (serialized) spelling is the
/// first of each pair.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum VariationType {
    #[default]
    String,
    Boolean,
    Number,
    Json,
}

impl VariationType {
    /// Canonical wire spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Boolean => "boolean",
            Self::Number => "number",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for VariationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VariationType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(Self::String),
            "boolean" | "bool" => Ok(Self::Boolean),
            "number" | "int" => Ok(Self::Number),
            "json" => Ok(Self::Json),
            other => Err(ProtocolError::UnsupportedVariationType(
                other.to_string(),
            )),
        }
    }
}

/// A typed flag value.
///
/// Serialized without a tag, so `Variation::Bool(true)` is just `true` in
/// JSON and clients see the same shape the engine would return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Variation {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Json(Value),
}

impl Variation {
    /// Interprets a raw JSON value as a variation of the declared `kind`.
    ///
    /// Engines commonly transmit every variation as a string, so
    /// `"true"`, `"42"` and `"{\"a\":1}"` are accepted for boolean, number
    /// and json respectively. A json variation whose string does not parse
    /// stays a JSON string.
    pub fn coerce(
        kind: VariationType,
        raw: &Value,
    ) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidValue {
            kind,
            value: raw.to_string(),
        };

        match (kind, raw) {
            (VariationType::String, Value::String(s)) => {
                Ok(Self::String(s.clone()))
            }
            (VariationType::String, Value::Null) => Err(invalid()),
            (VariationType::String, other) => {
                Ok(Self::String(other.to_string()))
            }
            (VariationType::Boolean, Value::Bool(b)) => Ok(Self::Bool(*b)),
            (VariationType::Boolean, Value::String(s)) => {
                match s.trim() {
                    "true" => Ok(Self::Bool(true)),
                    "false" => Ok(Self::Bool(false)),
                    _ => Err(invalid()),
                }
            }
            (VariationType::Number, Value::Number(n)) => {
                Ok(Self::Number(n.clone()))
            }
            (VariationType::Number, Value::String(s)) => s
                .trim()
                .parse::<serde_json::Number>()
                .map(Self::Number)
                .map_err(|_| invalid()),
            (VariationType::Json, Value::String(s)) => Ok(Self::Json(
                serde_json::from_str(s).unwrap_or_else(|_| raw.clone()),
            )),
            (VariationType::Json, other) => Ok(Self::Json(other.clone())),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Variation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Queries and results
// ---------------------------------------------------------------------------

/// The client-supplied part of a flag query.
///
/// Used as the body of `POST /{flag_id}/{target_id}` and as the first
/// message on a watch socket. Every field is optional, so `{}` is a valid
/// request: ids come from the URL path and the variation type defaults to
/// string.
///
/// `variation_type` stays a raw string here so that an unsupported kind is
/// reported as [`ProtocolError::UnsupportedVariationType`] rather than a
/// generic decode error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub target_attributes: BTreeMap<String, String>,
}

/// A fully resolved request for one flag/target evaluation.
///
/// Invariant: `flag_id` and `target_id` are non-empty. Construct through
/// [`FlagQuery::new`] or [`FlagQuery::from_request`] to keep it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagQuery {
    pub flag_id: String,
    pub target_id: String,
    pub target_name: String,
    pub variation_type: VariationType,
    pub target_attributes: BTreeMap<String, String>,
}

impl FlagQuery {
    /// A string-typed query with no attributes, as used by
    /// `GET /{flag_id}/{target_id}`.
    pub fn new(
        flag_id: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        let flag_id = flag_id.into();
        let target_id = target_id.into();
        if flag_id.is_empty() {
            return Err(ProtocolError::EmptyField("flag_id"));
        }
        if target_id.is_empty() {
            return Err(ProtocolError::EmptyField("target_id"));
        }
        Ok(Self {
            target_name: target_id.clone(),
            flag_id,
            target_id,
            variation_type: VariationType::default(),
            target_attributes: BTreeMap::new(),
        })
    }

    /// Resolves a client request against the ids taken from the URL path.
    ///
    /// Ids present in the body must equal the path ids; absent ones are
    /// filled in. `name` defaults to the target id.
    pub fn from_request(
        flag_id: &str,
        target_id: &str,
        request: FlagRequest,
    ) -> Result<Self, ProtocolError> {
        check_path("flag_id", flag_id, request.flag_id.as_deref())?;
        check_path("target_id", target_id, request.target_id.as_deref())?;

        let mut query = Self::new(flag_id, target_id)?;
        if let Some(kind) = request.variation_type.as_deref() {
            query.variation_type = kind.parse()?;
        }
        if let Some(name) = request.name.filter(|n| !n.is_empty()) {
            query.target_name = name;
        }
        query.target_attributes = request.target_attributes;
        Ok(query)
    }
}

fn check_path(
    field: &'static str,
    path: &str,
    body: Option<&str>,
) -> Result<(), ProtocolError> {
    match body {
        Some(body) if body != path => Err(ProtocolError::PathMismatch {
            field,
            path: path.to_string(),
            body: body.to_string(),
        }),
        _ => Ok(()),
    }
}

/// The result of one evaluation.
///
/// This is also the response body of the one-shot endpoints, and its three
/// fields are embedded unchanged in every watch value message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagValue {
    pub flag_id: String,
    pub flag_value: Variation,
    pub target_id: String,
}

// ---------------------------------------------------------------------------
// Change events
// ---------------------------------------------------------------------------

/// What happened to a flag, as reported by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    FlagUpdated,
    FlagDeleted,
    TargetUpdated,
    Unknown,
}

/// One change notification from the upstream relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The flag (or, for target events, the entity) the event is about.
    pub flag_id: String,
    pub kind: EventKind,
    /// Relay-side version counter, when the relay sends one.
    pub version: Option<u64>,
    /// A value embedded in the event, when the relay pushes one.
    pub value: Option<Value>,
    /// The payload exactly as received.
    pub raw_payload: Value,
}

// ---------------------------------------------------------------------------
// Watch messages (server → client)
// ---------------------------------------------------------------------------

/// Machine-readable error codes sent in watch diagnostics and HTTP error
/// bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    FlagNotFound,
    TargetNotFound,
    EvaluationTimeout,
    EvaluationFailed,
    RelayUnavailable,
    SubscriptionClosed,
    ConnectionNotFound,
    Internal,
}

/// Messages the server sends on a watch socket.
///
/// Internally tagged, so each message carries a `"type"` field:
///
/// ```json
/// {"type": "initial", "connection_id": "…", "message": "…",
///  "flag_id": "dark-mode", "flag_value": true, "target_id": "user-1",
///  "target_attributes": {}}
/// ```
///
/// The `flag_id`/`flag_value`/`target_id` triple is flattened from
/// [`FlagValue`], so value messages are a superset of the one-shot
/// response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchMessage {
    /// The value in effect when the watch started.
    Initial {
        connection_id: ConnectionId,
        message: String,
        #[serde(flatten)]
        state: FlagValue,
        #[serde(default)]
        target_attributes: BTreeMap<String, String>,
    },

    /// A value forwarded because the flag changed upstream.
    Update {
        connection_id: ConnectionId,
        message: String,
        #[serde(flatten)]
        state: FlagValue,
        #[serde(default)]
        target_attributes: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_flag_value: Option<Variation>,
        event: EventKind,
    },

    /// Keep-alive.
    Ping,

    /// A diagnostic. Always the last message before the server closes the
    /// socket.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<ConnectionId>,
        code: ErrorCode,
        message: String,
    },
}

impl WatchMessage {
    /// The first message of a watch.
    pub fn initial(
        connection_id: ConnectionId,
        query: &FlagQuery,
        state: FlagValue,
    ) -> Self {
        Self::Initial {
            connection_id,
            message: "Initiated connection to watch flag".to_string(),
            state,
            target_attributes: query.target_attributes.clone(),
        }
    }

    /// A forwarded change.
    pub fn update(
        connection_id: ConnectionId,
        query: &FlagQuery,
        state: FlagValue,
        previous_flag_value: Option<Variation>,
        event: EventKind,
    ) -> Self {
        let message = match event {
            EventKind::FlagDeleted => "Flag deleted",
            EventKind::TargetUpdated => "Target changed",
            EventKind::FlagUpdated | EventKind::Unknown => "Flag changed",
        };
        Self::Update {
            connection_id,
            message: message.to_string(),
            state,
            target_attributes: query.target_attributes.clone(),
            previous_flag_value,
            event,
        }
    }

    /// A diagnostic message.
    pub fn error(
        connection_id: Option<ConnectionId>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self::Error {
            connection_id,
            code,
            message: message.into(),
        }
    }
}
