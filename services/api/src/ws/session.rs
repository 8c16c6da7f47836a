//! Manages the WebSocket connection lifecycle for a realtime session.

use super::protocol::{ClientMessage, DEFAULT_AUDIO_MIME, ServerMessage};
use crate::{handlers, models::TurnResponse, state::AppState};
use anyhow::{Result, bail};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use parley_core::{SessionConfig, SessionError};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

type SocketSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let user_id = match handlers::user_id(&headers) {
        Ok(user_id) => user_id.to_string(),
        Err(e) => return e.into_response(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

/// Main handler for an individual WebSocket connection.
///
/// The first message must be `connect`. The socket is then bound to that
/// session until either side closes, and the session is closed with it.
#[instrument(name = "ws_session", skip_all, fields(user_id = %user_id, session_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: String) {
    info!("New WebSocket connection. Awaiting connect...");
    let (socket_tx, mut socket_rx) = socket.split();
    let socket_tx: SocketSink = Arc::new(Mutex::new(socket_tx));

    let (session_id, model) = match establish_session(&mut socket_rx, &state, &user_id).await {
        Ok(Some(bound)) => bound,
        Ok(None) => {
            info!("Client disconnected before sending connect message.");
            return;
        }
        Err(e) => {
            error!("Session initialization failed: {:?}", e);
            if let Err(send_err) = send_msg(
                &mut *socket_tx.lock().await,
                ServerMessage::Error {
                    message: e.to_string(),
                },
            )
            .await
            {
                warn!(error = %send_err, "Could not report initialization failure to client.");
            }
            return;
        }
    };
    tracing::Span::current().record("session_id", &session_id.to_string());

    if send_msg(
        &mut *socket_tx.lock().await,
        ServerMessage::Connected { session_id, model },
    )
    .await
    .is_err()
    {
        error!("Failed to send Connected message to client.");
        state.manager.close(session_id).await;
        return;
    }

    if let Err(e) = run_session(&state, &socket_tx, socket_rx, session_id).await {
        error!(error = ?e, "WebSocket session terminated with error.");
    }
    state.manager.close(session_id).await;
    info!("WebSocket session finished.");
}

/// Reads the `connect` message and opens or attaches to a session.
async fn establish_session(
    socket_rx: &mut SplitStream<WebSocket>,
    state: &AppState,
    user_id: &str,
) -> Result<Option<(Uuid, String)>> {
    let text = match socket_rx.next().await {
        Some(Ok(Message::Text(text))) => text,
        Some(Ok(_)) => bail!("First message was not a text `connect` message."),
        Some(Err(e)) => return Err(e.into()),
        None => return Ok(None),
    };
    let ClientMessage::Connect {
        session_id,
        model,
        initial_text,
    } = serde_json::from_str(&text)?
    else {
        bail!("First message must be `connect`");
    };

    let id = match session_id {
        Some(id) => {
            let info = state.manager.info(id).await?;
            if info.owner != user_id {
                return Err(SessionError::NotFound(id).into());
            }
            info!(%id, "Attaching to existing session");
            id
        }
        None => {
            let config = SessionConfig {
                model,
                initial_text,
            };
            state.manager.connect(user_id, config).await?
        }
    };
    let model = state
        .manager
        .info(id)
        .await?
        .model
        .unwrap_or_else(|| state.config.realtime_model.clone());
    Ok(Some((id, model)))
}

/// The main event loop for a bound socket.
///
/// Turns run on their own task so a `close` can still be received, and
/// unblock the turn, while a reply is being collected.
async fn run_session(
    state: &Arc<AppState>,
    socket_tx: &SocketSink,
    mut socket_rx: SplitStream<WebSocket>,
    session_id: Uuid,
) -> Result<()> {
    let mut audio_mime = DEFAULT_AUDIO_MIME.to_string();

    while let Some(msg_result) = socket_rx.next().await {
        let outcome = match msg_result? {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::UserMessage { text }) => {
                    state.manager.send_text(session_id, text).await
                }
                Ok(ClientMessage::AudioFormat { mime }) => {
                    audio_mime = mime;
                    Ok(())
                }
                Ok(ClientMessage::ProcessTurn) => {
                    spawn_turn(state.clone(), socket_tx.clone(), session_id);
                    Ok(())
                }
                Ok(ClientMessage::Close) => {
                    state.manager.close(session_id).await;
                    send_msg(
                        &mut *socket_tx.lock().await,
                        ServerMessage::Closed { session_id },
                    )
                    .await?;
                    break;
                }
                Ok(ClientMessage::Connect { .. }) => {
                    warn!("Ignoring connect on an already bound socket.");
                    send_error(socket_tx, "Socket is already bound to a session").await?;
                    Ok(())
                }
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed client message.");
                    send_error(socket_tx, &format!("Invalid message: {}", e)).await?;
                    Ok(())
                }
            },
            Message::Binary(data) => {
                state
                    .manager
                    .send_audio(session_id, data.to_vec(), &audio_mime)
                    .await
            }
            Message::Close(_) => {
                info!("Client sent close frame. Shutting down session.");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => Ok(()),
        };

        if let Err(e) = outcome {
            send_error(socket_tx, &e.to_string()).await?;
            if matches!(e, SessionError::NotFound(_)) {
                break;
            }
        }
    }
    Ok(())
}

fn spawn_turn(state: Arc<AppState>, socket_tx: SocketSink, session_id: Uuid) {
    tokio::spawn(async move {
        let msg = match state.manager.process_turn(session_id).await {
            Ok(result) => ServerMessage::TurnResult(TurnResponse::from(&result)),
            Err(e) => ServerMessage::Error {
                message: e.to_string(),
            },
        };
        if let Err(e) = send_msg(&mut *socket_tx.lock().await, msg).await {
            warn!(%session_id, error = %e, "Could not deliver turn result; socket is gone.");
        }
    });
}

async fn send_error(socket_tx: &SocketSink, message: &str) -> Result<()> {
    send_msg(
        &mut *socket_tx.lock().await,
        ServerMessage::Error {
            message: message.to_string(),
        },
    )
    .await
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
