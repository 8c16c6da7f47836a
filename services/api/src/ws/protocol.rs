//! Defines the WebSocket message protocol between a client and the API server.
//!
//! Control messages are JSON text frames. Audio travels as binary frames and is
//! tagged with the mime most recently announced by `audio_format`.

use crate::models::TurnResponse;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mime assumed for binary frames until the client announces one.
pub const DEFAULT_AUDIO_MIME: &str = "audio/pcm;rate=16000";

/// Messages sent from the client to the server.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opens a session, or attaches to an existing one. This must be the first message.
    Connect {
        /// An existing session owned by the caller to attach to.
        session_id: Option<Uuid>,
        model: Option<String>,
        #[serde(alias = "initialText")]
        initial_text: Option<String>,
    },
    /// Text to queue for the next turn.
    UserMessage { text: String },
    /// Declares the mime of subsequent binary audio frames.
    AudioFormat { mime: String },
    /// Sends everything queued and waits for the reply.
    ProcessTurn,
    /// Closes the session.
    Close,
}

/// Messages sent from the server to the client.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirms the session the socket is bound to.
    Connected { session_id: Uuid, model: String },
    /// The aggregated reply to a `process_turn`.
    TurnResult(TurnResponse),
    /// The session has been closed.
    Closed { session_id: Uuid },
    /// Reports an error. Fatal errors are followed by the socket closing.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TurnCompletion;
    use serde_json::json;

    #[test]
    fn test_client_messages_deserialize() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"connect","initialText":"Hi"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Connect {
                session_id: None,
                model: None,
                initial_text: Some("Hi".into()),
            }
        );

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"user_message","text":"hello"}"#).unwrap();
        assert_eq!(msg, ClientMessage::UserMessage { text: "hello".into() });

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"audio_format","mime":"audio/pcm;rate=24000"}"#)
                .unwrap();
        assert_eq!(
            msg,
            ClientMessage::AudioFormat {
                mime: "audio/pcm;rate=24000".into()
            }
        );

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"process_turn"}"#).unwrap();
        assert_eq!(msg, ClientMessage::ProcessTurn);

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn test_turn_result_is_flattened() {
        let msg = ServerMessage::TurnResult(TurnResponse {
            text: "Hi".into(),
            texts: vec!["Hi".into()],
            audio_wav: None,
            completed_by: TurnCompletion::Idle,
        });
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "turn_result",
                "text": "Hi",
                "texts": ["Hi"],
                "audio_wav": null,
                "completed_by": "idle"
            })
        );
    }
}
