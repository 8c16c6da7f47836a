//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API, WebSocket endpoint, and OpenAPI documentation.

use crate::{
    handlers,
    models::{
        AudioPayload, CreateSessionPayload, ErrorResponse, Message, MessageRole, Session,
        SessionDetails, TextPayload, TurnCompletion, TurnResponse,
    },
    state::AppState,
    ws::ws_handler,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::create_session,
        handlers::list_sessions,
        handlers::get_session,
        handlers::send_text,
        handlers::send_audio,
        handlers::process_turn,
        handlers::close_session,
    ),
    components(
        schemas(
            Session, SessionDetails, Message, MessageRole, CreateSessionPayload, TextPayload,
            AudioPayload, TurnResponse, TurnCompletion, ErrorResponse
        )
    ),
    tags(
        (name = "Parley API", description = "Realtime multimodal sessions over a streaming model")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    // Group all routes that require AppState into their own router.
    let api_router = Router::new()
        .route(
            "/sessions",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route(
            "/sessions/{id}",
            get(handlers::get_session).delete(handlers::close_session),
        )
        .route("/sessions/{id}/text", post(handlers::send_text))
        .route("/sessions/{id}/audio", post(handlers::send_audio))
        .route("/sessions/{id}/turn", post(handlers::process_turn))
        .route("/ws", get(ws_handler))
        // Apply the state ONLY to this group of routes.
        .with_state(app_state);

    // Create the final router that merges the stateful routes
    // with the stateless routes (like Swagger UI).
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
