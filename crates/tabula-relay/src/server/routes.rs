//! HTTP handlers.

use std::convert::Infallible;

use axum::Json;
use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use super::error::{ApiError, session_status};
use crate::relay::{Frame, RelayContext, rejection_frame};
use crate::session::SessionPayload;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub relay: RelayContext,
    /// Refuse new sessions while the upstream health check fails.
    pub require_upstream: bool,
}

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/init-stream", post(create_session))
        .route("/api/stream/{session_id}", get(open_stream))
        .route("/api/health", get(health))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Body of `POST /api/init-stream`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(default, alias = "markdownTable")]
    pub tabular_data: Option<String>,
    #[serde(default)]
    pub question: Option<String>,
}

impl CreateSessionRequest {
    /// Both fields, or `None` if either is missing or empty.
    pub fn into_payload(self) -> Option<SessionPayload> {
        let tabular_data = self.tabular_data.filter(|s| !s.is_empty())?;
        let question = self.question.filter(|s| !s.is_empty())?;
        Some(SessionPayload {
            tabular_data,
            question,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub status: &'static str,
    pub session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub upstream: &'static str,
    pub active_relays: usize,
    pub sessions: usize,
}

/// `POST /api/init-stream` — store the question and hand back a session id.
pub async fn create_session(
    State(state): State<AppState>,
    body: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let payload = request.into_payload().ok_or_else(|| {
        ApiError::BadRequest("tabularData and question are required".to_string())
    })?;

    if state.require_upstream
        && let Err(e) = state.relay.upstream().health().await
    {
        warn!(error = %e, "Refusing session, upstream is not reachable");
        return Err(ApiError::UpstreamUnavailable(e.to_string()));
    }

    let session_id = state.relay.sessions().create(payload).await?;
    Ok(Json(CreateSessionResponse {
        status: "success",
        session_id,
    }))
}

/// `GET /api/stream/{session_id}` — relay the generation as an event stream.
pub async fn open_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.relay.open_stream(&session_id).await {
        Ok(stream) => {
            info!(session_id = %session_id, "Stream attached");
            // The relay task runs detached; dropping the body ends it.
            drop(stream.task);
            event_stream(StatusCode::OK, ReceiverStream::new(stream.frames))
        }
        Err(e) => event_stream(
            session_status(&e),
            futures::stream::once(async move { rejection_frame(&e) }),
        ),
    }
}

/// `GET /api/health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let upstream = match state.relay.upstream().health().await {
        Ok(()) => "reachable",
        Err(_) => "unreachable",
    };
    Json(HealthResponse {
        status: "ok",
        upstream,
        active_relays: state.relay.active_relays(),
        sessions: state.relay.sessions().len().await,
    })
}

fn event_stream<S>(status: StatusCode, frames: S) -> Response
where
    S: Stream<Item = Frame> + Send + 'static,
{
    let events = frames.map(|frame| Ok::<Event, Infallible>(frame.into_event()));
    (status, Sse::new(events).keep_alive(KeepAlive::default())).into_response()
}
