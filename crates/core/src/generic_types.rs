//! Provider-agnostic types shared by every part of the session manager.
//!
//! Upstream engines translate their vendor events into [`MessageFragment`]s
//! and receive drained client input as a [`TurnInput`]; nothing downstream of
//! the connector boundary ever sees a vendor-specific shape.

use serde::{Deserialize, Serialize};

/// Configuration supplied by the caller when a session is opened.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Upstream model identifier. Engines fall back to their own default when absent.
    pub model: Option<String>,
    /// Text sent upstream as the first turn as soon as the channel is open.
    pub initial_text: Option<String>,
}

/// A chunk of audio bytes tagged with the mime type it was declared with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPart {
    pub data: Vec<u8>,
    pub mime: String,
}

/// One incremental piece of an upstream reply.
///
/// Text and audio may arrive together in a single fragment; a fragment with
/// `completion` set marks the end of the turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFragment {
    pub text: Option<String>,
    pub audio: Option<AudioPart>,
    pub completion: bool,
}

impl MessageFragment {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn audio(data: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            audio: Some(AudioPart {
                data,
                mime: mime.into(),
            }),
            ..Default::default()
        }
    }

    /// A bare end-of-turn marker.
    pub fn completion() -> Self {
        Self {
            completion: true,
            ..Default::default()
        }
    }

    /// True when the fragment carries text or audio, as opposed to only a marker.
    pub fn has_content(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.is_empty())
            || self.audio.as_ref().is_some_and(|a| !a.data.is_empty())
    }
}

/// Client input drained from a session's buffers, sent upstream as one turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnInput {
    pub texts: Vec<String>,
    pub audio_chunks: Vec<Vec<u8>>,
    /// Mime shared by every chunk in `audio_chunks`, if there are any.
    pub mime: Option<String>,
}

impl TurnInput {
    pub fn is_empty(&self) -> bool {
        self.texts.is_empty() && self.audio_chunks.is_empty()
    }

    pub fn audio_len(&self) -> usize {
        self.audio_chunks.iter().map(Vec::len).sum()
    }

    /// Summary of this input as a user entry in the conversation history.
    pub fn history_entry(&self) -> HistoryEntry {
        HistoryEntry {
            role: Role::User,
            text: self.texts.join("\n"),
            audio_bytes: self.audio_len(),
        }
    }
}

/// Which of the racing signals ended a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSignal {
    /// The upstream (or a close/error on the channel) delivered a completion marker.
    Marker,
    /// No fragment arrived within the idle window after content had been seen.
    Idle,
    /// The absolute cap from turn start elapsed.
    HardTimeout,
}

/// The aggregated reply for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnResult {
    /// Every fragment in arrival order, always terminated by a completion marker.
    pub messages: Vec<MessageFragment>,
    pub texts: Vec<String>,
    pub audio_parts: Vec<Vec<u8>>,
    /// Mime of the last audio part received, if any.
    pub audio_mime: Option<String>,
    pub completed_by: CompletionSignal,
}

impl TurnResult {
    pub fn text(&self) -> String {
        self.texts.concat()
    }

    pub fn audio_len(&self) -> usize {
        self.audio_parts.iter().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One completed contribution in a session's conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
    pub audio_bytes: usize,
}
