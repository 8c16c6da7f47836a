//! Concrete upstream engines for the realtime providers.
//!
//! Each engine opens one vendor WebSocket per session, spawns a reader task
//! that normalizes inbound frames into the session's event sink, and
//! translates drained turn input into the vendor's outbound messages.

pub mod gemini;
pub mod openai;

use crate::{
    audio_utils,
    config::{Config, Provider},
};
use anyhow::{Context, Result};
use parley_core::{EventSink, TurnInput, UpstreamEngine, normalize, wav::PcmFormat};
use std::sync::Arc;
use tracing::{debug, warn};

/// Builds the engine for the configured provider.
pub fn build_engine(config: &Config) -> Result<Arc<dyn UpstreamEngine>> {
    let engine: Arc<dyn UpstreamEngine> = match config.provider {
        Provider::OpenAI => Arc::new(openai::OpenAiEngine::new(
            config
                .openai_api_key
                .clone()
                .context("OpenAI API key not found")?,
            config.realtime_model.clone(),
            config.system_instructions.clone(),
        )),
        Provider::Gemini => Arc::new(gemini::GeminiEngine::new(
            config
                .gemini_api_key
                .clone()
                .context("Gemini API key not found")?,
            config.realtime_model.clone(),
            config.system_instructions.clone(),
        )),
    };
    Ok(engine)
}

/// Normalizes one raw upstream frame into the session's delivery queue.
pub(crate) fn dispatch_frame(events: &EventSink, text: &str) {
    let event = normalize::normalize_text_frame(text);
    if let Some(message) = event.error {
        events.on_error(message);
        return;
    }
    if event.fragments.is_empty() {
        debug!(session_id = %events.session_id(), "Upstream frame carried no content");
        return;
    }
    events.on_event(event.fragments);
}

/// Concatenates a turn's audio chunks and resamples them to `target_rate`.
///
/// Chunks are treated as little-endian PCM16 at the rate declared in their
/// mime, or 16 kHz when none is declared.
pub(crate) fn prepare_input_audio(input: &TurnInput, target_rate: u32) -> Result<Vec<u8>> {
    let format = input
        .mime
        .as_deref()
        .map(PcmFormat::from_mime)
        .unwrap_or_default();
    if format.channels != 1 {
        warn!(channels = format.channels, "Forwarding non-mono audio as mono");
    }
    let pcm = input.audio_chunks.concat();
    audio_utils::resample_pcm16(&pcm, format.sample_rate, target_rate)
        .context("Failed to resample input audio")
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::MessageFragment;
    use uuid::Uuid;

    #[test]
    fn test_dispatch_frame_routes_content_and_errors() {
        let (events, mut rx) = EventSink::new(Uuid::new_v4());

        dispatch_frame(&events, r#"{"type":"response.text.delta","delta":"Hi"}"#);
        dispatch_frame(&events, r#"{"type":"session.updated"}"#);
        dispatch_frame(&events, r#"{"type":"response.done"}"#);
        assert_eq!(rx.try_recv().unwrap(), MessageFragment::text("Hi"));
        assert_eq!(rx.try_recv().unwrap(), MessageFragment::completion());
        assert!(rx.try_recv().is_err());

        dispatch_frame(
            &events,
            r#"{"type":"error","error":{"message":"rate limited"}}"#,
        );
        assert!(!events.is_alive());
        let error = rx.try_recv().unwrap();
        assert!(error.text.unwrap().contains("rate limited"));
        assert!(rx.try_recv().unwrap().completion);
    }

    #[test]
    fn test_prepare_input_audio_concatenates_at_same_rate() {
        let input = TurnInput {
            texts: Vec::new(),
            audio_chunks: vec![vec![1, 0, 2, 0], vec![3, 0]],
            mime: Some("audio/pcm;rate=16000".into()),
        };
        assert_eq!(
            prepare_input_audio(&input, 16000).unwrap(),
            vec![1, 0, 2, 0, 3, 0]
        );
    }

    #[test]
    fn test_prepare_input_audio_resamples_to_target() {
        let input = TurnInput {
            texts: Vec::new(),
            audio_chunks: vec![vec![0u8; 16000 * 2]],
            mime: Some("audio/pcm;rate=16000".into()),
        };
        let out = prepare_input_audio(&input, 24000).unwrap();
        let samples = out.len() / 2;
        assert!((samples as f64 - 24000.0).abs() / 24000.0 < 0.05);
    }
}
