//! Normalization of raw upstream JSON events into [`MessageFragment`]s.
//!
//! Vendors have spelled "the turn is done" in several ways over time; every
//! one of them collapses into `MessageFragment::completion` here so that the
//! detector and aggregator never look at vendor fields.

use crate::generic_types::MessageFragment;
use base64::Engine;
use serde_json::Value;
use tracing::warn;

/// Mime of the PCM16 audio OpenAI Realtime streams back.
pub const OPENAI_OUTPUT_MIME: &str = "audio/pcm;rate=24000";

/// Flags that have been observed to mean "turn complete".
const COMPLETION_FLAGS: &[&str] = &[
    "turnComplete",
    "turn_complete",
    "generationComplete",
    "generation_complete",
    "done",
    "complete",
    "isComplete",
];

/// The result of inspecting one upstream event.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct NormalizedEvent {
    pub fragments: Vec<MessageFragment>,
    /// Set when the event reports an upstream failure.
    pub error: Option<String>,
}

/// Parses a raw text frame and normalizes it. Frames that are not JSON produce
/// nothing.
pub fn normalize_text_frame(text: &str) -> NormalizedEvent {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => normalize_event(&value),
        Err(e) => {
            warn!(error = %e, "Ignoring non-JSON upstream frame");
            NormalizedEvent::default()
        }
    }
}

/// Normalizes one decoded upstream event.
pub fn normalize_event(value: &Value) -> NormalizedEvent {
    if let Some(error) = error_message(value) {
        return NormalizedEvent {
            fragments: Vec::new(),
            error: Some(error),
        };
    }

    let fragments = match value.get("type").and_then(Value::as_str) {
        Some(kind) => typed_event(kind, value),
        None => content_event(value),
    };
    NormalizedEvent {
        fragments,
        error: None,
    }
}

fn error_message(value: &Value) -> Option<String> {
    let is_error_type = value.get("type").and_then(Value::as_str) == Some("error");
    let error = value.get("error")?;
    if !is_error_type && !error.is_object() && !error.is_string() {
        return None;
    }
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .unwrap_or("unknown upstream error");
    Some(message.to_string())
}

/// OpenAI-style events discriminated by a `type` field.
fn typed_event(kind: &str, value: &Value) -> Vec<MessageFragment> {
    let delta = || value.get("delta").and_then(Value::as_str);
    match kind {
        "response.text.delta" | "response.audio_transcript.delta" => delta()
            .filter(|d| !d.is_empty())
            .map(|d| vec![MessageFragment::text(d)])
            .unwrap_or_default(),
        "response.audio.delta" => delta()
            .and_then(decode_base64)
            .map(|data| vec![MessageFragment::audio(data, OPENAI_OUTPUT_MIME)])
            .unwrap_or_default(),
        "response.done" => vec![MessageFragment::completion()],
        // `*.done` summaries repeat the deltas and lifecycle events carry no content.
        _ => Vec::new(),
    }
}

/// Gemini Live `serverContent` events and flat legacy shapes.
fn content_event(value: &Value) -> Vec<MessageFragment> {
    let content = field(value, "serverContent", "server_content").unwrap_or(value);

    let mut fragments = Vec::new();
    if let Some(parts) = field(content, "modelTurn", "model_turn")
        .and_then(|turn| turn.get("parts"))
        .and_then(Value::as_array)
    {
        fragments.extend(parts.iter().filter_map(part_fragment));
    } else if let Some(fragment) = part_fragment(content) {
        fragments.push(fragment);
    }

    if is_complete(content) || (!std::ptr::eq(content, value) && is_complete(value)) {
        fragments.push(MessageFragment::completion());
    }
    fragments
}

fn part_fragment(part: &Value) -> Option<MessageFragment> {
    let text = part
        .get("text")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    let audio = match field(part, "inlineData", "inline_data") {
        Some(blob) => blob_audio(blob),
        None => part
            .get("audio")
            .and_then(Value::as_str)
            .and_then(decode_base64)
            .map(|data| (data, mime_of(part).unwrap_or("audio/pcm").to_string())),
    };

    if text.is_none() && audio.is_none() {
        return None;
    }
    let mut fragment = MessageFragment {
        text,
        ..Default::default()
    };
    if let Some((data, mime)) = audio {
        fragment.audio = Some(crate::generic_types::AudioPart { data, mime });
    }
    Some(fragment)
}

fn blob_audio(blob: &Value) -> Option<(Vec<u8>, String)> {
    let data = blob.get("data").and_then(Value::as_str).and_then(decode_base64)?;
    let mime = mime_of(blob).unwrap_or("audio/pcm").to_string();
    Some((data, mime))
}

fn mime_of(value: &Value) -> Option<&str> {
    field(value, "mimeType", "mime_type")
        .or_else(|| value.get("mime"))
        .and_then(Value::as_str)
}

fn is_complete(value: &Value) -> bool {
    COMPLETION_FLAGS
        .iter()
        .any(|flag| value.get(*flag).and_then(Value::as_bool) == Some(true))
}

fn field<'a>(value: &'a Value, camel: &str, snake: &str) -> Option<&'a Value> {
    value.get(camel).or_else(|| value.get(snake))
}

fn decode_base64(data: &str) -> Option<Vec<u8>> {
    match base64::engine::general_purpose::STANDARD.decode(data) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(error = %e, "Dropping undecodable base64 audio payload");
            None
        }
    }
}
