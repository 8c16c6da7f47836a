//! Upstream engine backed by the Gemini Live WebSocket.

use super::{dispatch_frame, prepare_input_audio};
use async_trait::async_trait;
use gemini_realtime::{
    Blob, INPUT_SAMPLE_RATE, LiveConfig, LiveReceiver, LiveSender, Part, ResponseModality,
};
use parley_core::{
    EventSink, SessionConfig, TurnInput, UpstreamChannel, UpstreamEngine, UpstreamError,
};
use tokio::task::JoinHandle;
use tracing::{info, instrument};
use uuid::Uuid;

pub struct GeminiEngine {
    api_key: String,
    default_model: String,
    system_instructions: Option<String>,
}

impl GeminiEngine {
    pub fn new(api_key: String, default_model: String, system_instructions: Option<String>) -> Self {
        Self {
            api_key,
            default_model,
            system_instructions,
        }
    }

    fn live_config(&self, config: &SessionConfig) -> LiveConfig {
        LiveConfig {
            model: config
                .model
                .clone()
                .unwrap_or_else(|| self.default_model.clone()),
            system_instruction: self.system_instructions.clone(),
            response_modalities: vec![ResponseModality::Audio],
            ..LiveConfig::new(self.api_key.clone())
        }
    }
}

#[async_trait]
impl UpstreamEngine for GeminiEngine {
    #[instrument(name = "gemini_open", skip_all, fields(session_id = %session_id))]
    async fn open(
        &self,
        session_id: Uuid,
        config: &SessionConfig,
        events: EventSink,
    ) -> Result<Box<dyn UpstreamChannel>, UpstreamError> {
        let live_config = self.live_config(config);
        let (sender, receiver) = gemini_realtime::connect(&live_config)
            .await
            .map_err(UpstreamError::Connect)?;
        info!(model = %live_config.model, "Opened Gemini Live channel");

        let reader = tokio::spawn(read_frames(receiver, events));
        Ok(Box::new(GeminiChannel { sender, reader }))
    }
}

async fn read_frames(mut receiver: LiveReceiver, events: EventSink) {
    loop {
        match receiver.next_message().await {
            Ok(Some(text)) => dispatch_frame(&events, &text),
            Ok(None) => {
                events.on_close();
                break;
            }
            Err(e) => {
                events.on_error(format!("{e:#}"));
                break;
            }
        }
    }
}

struct GeminiChannel {
    sender: LiveSender,
    reader: JoinHandle<()>,
}

/// Builds the parts of one user turn: texts first, then the audio as a single inline blob.
fn turn_parts(input: &TurnInput) -> anyhow::Result<Vec<Part>> {
    let mut parts: Vec<Part> = input.texts.iter().map(Part::text).collect();
    if !input.audio_chunks.is_empty() {
        let pcm = prepare_input_audio(input, INPUT_SAMPLE_RATE)?;
        parts.push(Part::inline_data(Blob::from_bytes(
            &pcm,
            format!("audio/pcm;rate={INPUT_SAMPLE_RATE}"),
        )));
    }
    Ok(parts)
}

#[async_trait]
impl UpstreamChannel for GeminiChannel {
    async fn send(&mut self, input: TurnInput) -> Result<(), UpstreamError> {
        let parts = turn_parts(&input).map_err(UpstreamError::Send)?;
        self.sender
            .send_turn(parts)
            .await
            .map_err(UpstreamError::Send)
    }

    async fn close(&mut self) -> Result<(), UpstreamError> {
        let result = self.sender.close().await;
        self.reader.abort();
        result.map_err(UpstreamError::Send)
    }
}

impl Drop for GeminiChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
