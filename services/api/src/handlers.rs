//! Axum Handlers for the REST API
//!
//! Each handler maps onto one session-manager operation. Sessions are scoped
//! to the caller named in the `x-user-id` header; another user's session is
//! reported as not found.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use base64::Engine;
use parley_core::{SessionConfig, SessionError};
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::{
    models::{
        AudioPayload, CreateSessionPayload, ErrorResponse, Session, SessionDetails, TextPayload,
        TurnResponse,
    },
    state::AppState,
};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    ServiceUnavailable(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, message),
            ApiError::ServiceUnavailable(message) => {
                warn!("Upstream unavailable: {}", message);
                (StatusCode::SERVICE_UNAVAILABLE, message)
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal server error occurred.".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { message })).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let message = err.to_string();
        match err {
            SessionError::NotFound(_) => ApiError::NotFound(message),
            SessionError::TurnInProgress(_) => ApiError::Conflict(message),
            SessionError::MixedAudioFormat { .. } => ApiError::BadRequest(message),
            SessionError::UpstreamConnect(_) | SessionError::Upstream(_) => {
                ApiError::ServiceUnavailable(message)
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::InternalServerError(err)
    }
}

pub(crate) fn user_id(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest("x-user-id header is required".to_string()))
}

/// Resolves a session the caller owns. Sessions owned by someone else are
/// indistinguishable from unknown ones.
async fn owned_session(state: &AppState, user_id: &str, id: Uuid) -> Result<Session, ApiError> {
    let info = state.manager.info(id).await?;
    if info.owner != user_id {
        return Err(SessionError::NotFound(id).into());
    }
    Ok(info.into())
}

/// Open a realtime session.
#[utoipa::path(
    post,
    path = "/sessions",
    request_body = CreateSessionPayload,
    responses(
        (status = 201, description = "Session created successfully", body = Session),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 503, description = "Upstream engine unavailable", body = ErrorResponse)
    ),
    params(
        ("x-user-id" = String, Header, description = "The ID of the user creating the session")
    )
)]
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateSessionPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user_id(&headers)?;
    let config = SessionConfig {
        model: payload.model,
        initial_text: payload.initial_text,
    };
    let id = state.manager.connect(user_id, config).await?;
    let session = owned_session(&state, user_id, id).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// List the caller's open sessions.
#[utoipa::path(
    get,
    path = "/sessions",
    responses(
        (status = 200, description = "List of sessions", body = [Session]),
        (status = 400, description = "Bad request", body = ErrorResponse)
    ),
    params(
        ("x-user-id" = String, Header, description = "The ID of the user")
    )
)]
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Session>>, ApiError> {
    let user_id = user_id(&headers)?;
    let sessions = state.manager.sessions_for(user_id).await;
    Ok(Json(sessions.into_iter().map(Session::from).collect()))
}

/// Get a session and its conversation history.
#[utoipa::path(
    get,
    path = "/sessions/{id}",
    responses(
        (status = 200, description = "Session details", body = SessionDetails),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = String, Header, description = "The ID of the user")
    )
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user_id(&headers)?;
    let session = owned_session(&state, user_id, id).await?;
    let history = state.manager.history(id).await?;
    Ok((
        StatusCode::OK,
        Json(SessionDetails {
            session,
            history: history.into_iter().map(Into::into).collect(),
        }),
    ))
}

/// Queue text for the next turn.
#[utoipa::path(
    post,
    path = "/sessions/{id}/text",
    request_body = TextPayload,
    responses(
        (status = 204, description = "Text queued"),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = String, Header, description = "The ID of the user")
    )
)]
pub async fn send_text(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(payload): Json<TextPayload>,
) -> Result<StatusCode, ApiError> {
    let user_id = user_id(&headers)?;
    owned_session(&state, user_id, id).await?;
    state.manager.send_text(id, payload.text).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Queue an audio chunk for the next turn.
#[utoipa::path(
    post,
    path = "/sessions/{id}/audio",
    request_body = AudioPayload,
    responses(
        (status = 204, description = "Audio queued"),
        (status = 400, description = "Invalid audio or mixed formats", body = ErrorResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = String, Header, description = "The ID of the user")
    )
)]
pub async fn send_audio(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(payload): Json<AudioPayload>,
) -> Result<StatusCode, ApiError> {
    let user_id = user_id(&headers)?;
    let data = base64::engine::general_purpose::STANDARD
        .decode(&payload.data)
        .map_err(|e| ApiError::BadRequest(format!("Audio data is not valid base64: {}", e)))?;
    owned_session(&state, user_id, id).await?;
    state.manager.send_audio(id, data, &payload.mime).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Send everything queued and wait for the reply.
#[utoipa::path(
    post,
    path = "/sessions/{id}/turn",
    responses(
        (status = 200, description = "The aggregated reply", body = TurnResponse),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 409, description = "A turn is already in progress", body = ErrorResponse),
        (status = 503, description = "Upstream channel is gone", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = String, Header, description = "The ID of the user")
    )
)]
pub async fn process_turn(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<TurnResponse>, ApiError> {
    let user_id = user_id(&headers)?;
    owned_session(&state, user_id, id).await?;
    let result = state.manager.process_turn(id).await?;
    Ok(Json(TurnResponse::from(&result)))
}

/// Close a session.
#[utoipa::path(
    delete,
    path = "/sessions/{id}",
    responses(
        (status = 204, description = "Session closed"),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID"),
        ("x-user-id" = String, Header, description = "The ID of the user")
    )
)]
pub async fn close_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let user_id = user_id(&headers)?;
    owned_session(&state, user_id, id).await?;
    state.manager.close(id).await;
    Ok(StatusCode::NO_CONTENT)
}
