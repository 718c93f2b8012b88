//! HTTP routes: one-shot evaluation, the watch upgrade, health and
//! diagnostics.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use flagwatch_eval::{EvalError, Evaluator, evaluate_with_timeout};
use flagwatch_protocol::{
    Codec, ConnectionId, ErrorCode, FlagQuery, FlagRequest, FlagValue,
    ProtocolError,
};
use flagwatch_session::ConnectionSession;
use flagwatch_transport::WebSocketConnection;
use serde::Serialize;
use serde_json::{Value, json};

use crate::FlagwatchError;
use crate::handler::handle_watch;
use crate::server::ServerState;

type AppState<E> = State<Arc<ServerState<E>>>;

pub(crate) fn router<E: Evaluator>(state: Arc<ServerState<E>>) -> Router {
    Router::new()
        .route("/health", get(health::<E>))
        .route("/reauthenticate", post(reauthenticate::<E>))
        .route("/_diagnostics/connections", get(list_connections::<E>))
        .route(
            "/_diagnostics/connections/{connection_id}",
            get(get_connection::<E>),
        )
        .route(
            "/{flag_id}/{target_id}",
            get(evaluate_get::<E>).post(evaluate_post::<E>),
        )
        .route("/{flag_id}/{target_id}/watch", get(watch::<E>))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// An error rendered as `{"code": ..., "message": ...}`.
#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    code: ErrorCode,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: ErrorCode,
    message: &'a str,
}

impl ApiError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: status_for(code),
            code,
            message: message.into(),
        }
    }
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
        ErrorCode::FlagNotFound
        | ErrorCode::TargetNotFound
        | ErrorCode::ConnectionNotFound => StatusCode::NOT_FOUND,
        ErrorCode::EvaluationTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::EvaluationFailed => StatusCode::BAD_GATEWAY,
        ErrorCode::RelayUnavailable | ErrorCode::SubscriptionClosed => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ProtocolError> for ApiError {
    fn from(e: ProtocolError) -> Self {
        FlagwatchError::from(e).into()
    }
}

impl From<EvalError> for ApiError {
    fn from(e: EvalError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<FlagwatchError> for ApiError {
    fn from(e: FlagwatchError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(code = ?self.code, message = %self.message, "request failed");
        }
        let body = ErrorBody {
            code: self.code,
            message: &self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// One-shot evaluation
// ---------------------------------------------------------------------------

async fn evaluate_get<E: Evaluator>(
    State(state): AppState<E>,
    Path((flag_id, target_id)): Path<(String, String)>,
) -> Result<Json<FlagValue>, ApiError> {
    let query = FlagQuery::new(flag_id, target_id)?;
    evaluate(&state, &query).await
}

/// Same as GET, but the body may carry a [`FlagRequest`]. An empty body
/// means defaults.
async fn evaluate_post<E: Evaluator>(
    State(state): AppState<E>,
    Path((flag_id, target_id)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<FlagValue>, ApiError> {
    let request: FlagRequest = if body.iter().all(u8::is_ascii_whitespace) {
        FlagRequest::default()
    } else {
        state.codec.decode(&body)?
    };
    let query = FlagQuery::from_request(&flag_id, &target_id, request)?;
    evaluate(&state, &query).await
}

async fn evaluate<E: Evaluator>(
    state: &ServerState<E>,
    query: &FlagQuery,
) -> Result<Json<FlagValue>, ApiError> {
    let value = evaluate_with_timeout(
        &state.evaluator,
        query,
        state.session_config.evaluation_timeout,
    )
    .await?;
    tracing::info!(
        flag_id = %value.flag_id,
        target_id = %value.target_id,
        flag_value = %value.flag_value,
        "evaluated feature flag"
    );
    Ok(Json(value))
}

// ---------------------------------------------------------------------------
// Watch
// ---------------------------------------------------------------------------

async fn watch<E: Evaluator>(
    State(state): AppState<E>,
    Path((flag_id, target_id)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| {
        handle_watch(WebSocketConnection::new(socket), flag_id, target_id, state)
    })
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

async fn health<E: Evaluator>(State(state): AppState<E>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "relay": state.feed.status(),
        "active_connections": state.registry.len(),
    }))
}

async fn reauthenticate<E: Evaluator>(
    State(state): AppState<E>,
) -> Result<Json<Value>, ApiError> {
    state.evaluator.reauthenticate().await?;
    tracing::info!("re-authenticated with evaluation engine");
    Ok(Json(json!({})))
}

async fn list_connections<E: Evaluator>(
    State(state): AppState<E>,
) -> Json<Vec<ConnectionSession>> {
    Json(state.registry.snapshot())
}

async fn get_connection<E: Evaluator>(
    State(state): AppState<E>,
    Path(connection_id): Path<String>,
) -> Result<Json<ConnectionSession>, ApiError> {
    let id: ConnectionId = connection_id.parse()?;
    state.registry.get(&id).map(Json).ok_or_else(|| {
        ApiError::new(
            ErrorCode::ConnectionNotFound,
            format!("no open connection {id}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::to_bytes;

    use super::*;

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_status_for_codes() {
        assert_eq!(status_for(ErrorCode::BadRequest), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorCode::FlagNotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorCode::TargetNotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(ErrorCode::EvaluationTimeout),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(status_for(ErrorCode::EvaluationFailed), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_api_error_body_shape() {
        let response =
            ApiError::from(EvalError::FlagNotFound("dark-mode".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_json(response).await;
        assert_eq!(body["code"], "flag_not_found");
        assert!(body["message"].as_str().unwrap().contains("dark-mode"));
    }

    #[tokio::test]
    async fn test_api_error_from_timeout_is_gateway_timeout() {
        let response =
            ApiError::from(EvalError::Timeout(Duration::from_secs(5))).into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body_json(response).await["code"], "evaluation_timeout");
    }

    #[tokio::test]
    async fn test_api_error_from_unsupported_type_is_bad_request() {
        let error: ApiError = ProtocolError::UnsupportedVariationType("float".into()).into();
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "bad_request");
    }
}
