//! Upstream engine backed by the OpenAI Realtime WebSocket.

use super::{dispatch_frame, prepare_input_audio};
use crate::audio_utils::OPENAI_REALTIME_API_PCM16_SAMPLE_RATE;
use anyhow::{Context, Result};
use async_openai::types::realtime::{self as oai_realtime, ClientEvent as OAIClientEvent};
use async_trait::async_trait;
use base64::Engine;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use parley_core::{
    EventSink, SessionConfig, TurnInput, UpstreamChannel, UpstreamEngine, UpstreamError,
};
use tokio::{net::TcpStream, task::JoinHandle};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::{debug, info, instrument};
use uuid::Uuid;

const REALTIME_ENDPOINT: &str = "wss://api.openai.com/v1/realtime";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct OpenAiEngine {
    api_key: String,
    default_model: String,
    system_instructions: Option<String>,
}

impl OpenAiEngine {
    pub fn new(api_key: String, default_model: String, system_instructions: Option<String>) -> Self {
        Self {
            api_key,
            default_model,
            system_instructions,
        }
    }

    async fn connect(&self, model: &str) -> Result<WsStream> {
        let url = format!("{REALTIME_ENDPOINT}?model={model}");
        let mut request = url.into_client_request()?;
        request
            .headers_mut()
            .insert("Authorization", format!("Bearer {}", self.api_key).parse()?);
        request
            .headers_mut()
            .insert("OpenAI-Beta", "realtime=v1".parse()?);

        let (ws_stream, _) = connect_async(request)
            .await
            .context("Failed to connect to OpenAI Realtime WebSocket")?;
        Ok(ws_stream)
    }

    /// Configures text and audio output. Turn detection is left to the
    /// session manager, so input goes in as conversation items rather than
    /// through the server-VAD input buffer.
    fn session_update(&self, model: &str) -> OAIClientEvent {
        let session = oai_realtime::SessionResource {
            model: Some(model.to_string()),
            modalities: Some(vec!["text".to_string(), "audio".to_string()]),
            instructions: self.system_instructions.clone(),
            voice: Some(oai_realtime::RealtimeVoice::Alloy),
            input_audio_format: Some(oai_realtime::AudioFormat::PCM16),
            output_audio_format: Some(oai_realtime::AudioFormat::PCM16),
            ..Default::default()
        };
        OAIClientEvent::SessionUpdate(oai_realtime::SessionUpdateEvent {
            session,
            event_id: None,
        })
    }
}

#[async_trait]
impl UpstreamEngine for OpenAiEngine {
    #[instrument(name = "openai_open", skip_all, fields(session_id = %session_id))]
    async fn open(
        &self,
        session_id: Uuid,
        config: &SessionConfig,
        events: EventSink,
    ) -> Result<Box<dyn UpstreamChannel>, UpstreamError> {
        let model = config.model.as_deref().unwrap_or(&self.default_model);
        let ws_stream = self.connect(model).await.map_err(UpstreamError::Connect)?;
        let (mut sink, stream) = ws_stream.split();
        send_event(&mut sink, &self.session_update(model))
            .await
            .map_err(UpstreamError::Connect)?;
        info!(%model, "Opened OpenAI Realtime channel");

        let reader = tokio::spawn(read_frames(stream, events));
        Ok(Box::new(OpenAiChannel { sink, reader }))
    }
}

async fn send_event(sink: &mut SplitSink<WsStream, WsMessage>, event: &OAIClientEvent) -> Result<()> {
    sink.send(WsMessage::Text(serde_json::to_string(event)?.into()))
        .await
        .context("Failed to send event to OpenAI")
}

async fn read_frames(mut stream: SplitStream<WsStream>, events: EventSink) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => dispatch_frame(&events, text.as_str()),
            Ok(WsMessage::Close(frame)) => {
                info!(?frame, "OpenAI WebSocket closed by server");
                break;
            }
            Ok(other) => debug!(?other, "Ignoring non-text frame"),
            Err(e) => {
                events.on_error(format!("Error reading from OpenAI WebSocket: {e}"));
                return;
            }
        }
    }
    events.on_close();
}

/// Builds the user message item carrying a whole turn.
fn turn_item(input: &TurnInput) -> Result<oai_realtime::Item> {
    let mut content: Vec<oai_realtime::ItemContent> = input
        .texts
        .iter()
        .map(|text| oai_realtime::ItemContent {
            r#type: oai_realtime::ItemContentType::InputText,
            text: Some(text.clone()),
            audio: None,
            transcript: None,
        })
        .collect();
    if !input.audio_chunks.is_empty() {
        let pcm = prepare_input_audio(input, OPENAI_REALTIME_API_PCM16_SAMPLE_RATE)?;
        content.push(oai_realtime::ItemContent {
            r#type: oai_realtime::ItemContentType::InputAudio,
            text: None,
            audio: Some(base64::engine::general_purpose::STANDARD.encode(pcm)),
            transcript: None,
        });
    }

    Ok(oai_realtime::Item {
        r#type: Some(oai_realtime::ItemType::Message),
        role: Some(oai_realtime::ItemRole::User),
        content: Some(content),
        id: None,
        status: None,
        call_id: None,
        name: None,
        arguments: None,
        output: None,
    })
}

struct OpenAiChannel {
    sink: SplitSink<WsStream, WsMessage>,
    reader: JoinHandle<()>,
}

impl OpenAiChannel {
    async fn send_turn(&mut self, input: &TurnInput) -> Result<()> {
        let create_item = OAIClientEvent::ConversationItemCreate(
            oai_realtime::ConversationItemCreateEvent {
                item: turn_item(input)?,
                event_id: None,
                previous_item_id: None,
            },
        );
        send_event(&mut self.sink, &create_item).await?;

        let create_response = OAIClientEvent::ResponseCreate(oai_realtime::ResponseCreateEvent {
            response: None,
            event_id: None,
        });
        send_event(&mut self.sink, &create_response).await
    }
}

#[async_trait]
impl UpstreamChannel for OpenAiChannel {
    async fn send(&mut self, input: TurnInput) -> Result<(), UpstreamError> {
        self.send_turn(&input).await.map_err(UpstreamError::Send)
    }

    async fn close(&mut self) -> Result<(), UpstreamError> {
        let result = self
            .sink
            .close()
            .await
            .context("Failed to close OpenAI WebSocket");
        self.reader.abort();
        result.map_err(UpstreamError::Send)
    }
}

impl Drop for OpenAiChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
