//! API Models
//!
//! Request and response payloads for the REST API, documented with `utoipa`.

use crate::audio_utils;
use chrono::{DateTime, Utc};
use parley_core::{CompletionSignal, HistoryEntry, Role, SessionInfo, TurnResult};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Deserialize, ToSchema, Debug, Default)]
pub struct CreateSessionPayload {
    /// Upstream model to use instead of the service default.
    #[schema(example = "gpt-4o-realtime-preview-2024-10-01")]
    pub model: Option<String>,
    /// Text sent upstream as soon as the channel opens.
    #[serde(alias = "initialText")]
    #[schema(example = "You are a patient language tutor.")]
    pub initial_text: Option<String>,
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct TextPayload {
    #[schema(example = "How do I say 'good morning' in Italian?")]
    pub text: String,
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct AudioPayload {
    /// Base64-encoded raw audio.
    pub data: String,
    #[schema(example = "audio/pcm;rate=16000")]
    pub mime: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct Session {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    pub user_id: String,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub idle_ms: u64,
    pub turn_in_progress: bool,
    pub upstream_alive: bool,
    pub history_len: usize,
}

impl From<SessionInfo> for Session {
    fn from(info: SessionInfo) -> Self {
        Self {
            id: info.id,
            user_id: info.owner,
            model: info.model,
            created_at: info.created_at,
            idle_ms: info.idle_for.as_millis() as u64,
            turn_in_progress: info.turn_in_progress,
            upstream_alive: info.upstream_alive,
            history_len: info.history_len,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl From<Role> for MessageRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => MessageRole::User,
            Role::Assistant => MessageRole::Assistant,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct Message {
    #[schema(value_type = String, example = "user")]
    pub role: MessageRole,
    pub content: String,
    pub audio_bytes: usize,
}

impl From<HistoryEntry> for Message {
    fn from(entry: HistoryEntry) -> Self {
        Self {
            role: entry.role.into(),
            content: entry.text,
            audio_bytes: entry.audio_bytes,
        }
    }
}

#[derive(Serialize, ToSchema, Debug)]
pub struct SessionDetails {
    pub session: Session,
    pub history: Vec<Message>,
}

/// Which signal ended a turn.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TurnCompletion {
    Marker,
    Idle,
    HardTimeout,
}

impl From<CompletionSignal> for TurnCompletion {
    fn from(signal: CompletionSignal) -> Self {
        match signal {
            CompletionSignal::Marker => TurnCompletion::Marker,
            CompletionSignal::Idle => TurnCompletion::Idle,
            CompletionSignal::HardTimeout => TurnCompletion::HardTimeout,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct TurnResponse {
    /// The reply text, concatenated.
    pub text: String,
    /// The reply text as it arrived, one entry per fragment.
    pub texts: Vec<String>,
    /// The reply audio as one base64 WAV file.
    pub audio_wav: Option<String>,
    #[schema(value_type = String, example = "marker")]
    pub completed_by: TurnCompletion,
}

impl From<&TurnResult> for TurnResponse {
    fn from(result: &TurnResult) -> Self {
        Self {
            text: result.text(),
            texts: result.texts.clone(),
            audio_wav: audio_utils::wav_base64(&result.audio_parts, result.audio_mime.as_deref()),
            completed_by: result.completed_by.into(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::MessageFragment;
    use std::time::Duration;

    #[test]
    fn test_create_session_payload_accepts_both_spellings() {
        let payload: CreateSessionPayload =
            serde_json::from_str(r#"{"initialText": "Hi there"}"#).unwrap();
        assert_eq!(payload.initial_text.as_deref(), Some("Hi there"));
        assert!(payload.model.is_none());

        let payload: CreateSessionPayload =
            serde_json::from_str(r#"{"model": "m", "initial_text": "Hi"}"#).unwrap();
        assert_eq!(payload.model.as_deref(), Some("m"));
        assert_eq!(payload.initial_text.as_deref(), Some("Hi"));

        let payload: CreateSessionPayload = serde_json::from_str("{}").unwrap();
        assert!(payload.initial_text.is_none());
    }

    #[test]
    fn test_session_from_info() {
        let id = Uuid::new_v4();
        let session = Session::from(SessionInfo {
            id,
            owner: "user-1".into(),
            model: None,
            created_at: Utc::now(),
            idle_for: Duration::from_millis(1500),
            turn_in_progress: true,
            upstream_alive: true,
            history_len: 4,
        });
        assert_eq!(session.id, id);
        assert_eq!(session.user_id, "user-1");
        assert_eq!(session.idle_ms, 1500);
        assert!(session.turn_in_progress);
    }

    #[test]
    fn test_message_role_serialization() {
        let message = Message::from(HistoryEntry {
            role: Role::Assistant,
            text: "Ciao".into(),
            audio_bytes: 0,
        });
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["content"], "Ciao");
    }

    #[test]
    fn test_turn_response_from_result() {
        let result = TurnResult {
            messages: vec![MessageFragment::completion()],
            texts: vec!["Buon".into(), "giorno".into()],
            audio_parts: vec![vec![0; 4]],
            audio_mime: Some("audio/pcm;rate=24000".into()),
            completed_by: CompletionSignal::HardTimeout,
        };
        let response = TurnResponse::from(&result);
        assert_eq!(response.text, "Buongiorno");
        assert_eq!(response.texts.len(), 2);
        assert!(response.audio_wav.is_some());

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["completed_by"], "hard_timeout");
    }

    #[test]
    fn test_error_response_serialization() {
        let error = ErrorResponse {
            message: "Session not found".to_string(),
        };
        let json = serde_json::to_string(&error).unwrap();
        assert_eq!(json, r#"{"message":"Session not found"}"#);
    }
}
