//! Connection handling for the Gemini Live WebSocket.

use crate::types::{
    BidiGenerateContentClientContent, BidiGenerateContentSetup, ClientMessage, Content,
    GenerationConfig, Part, ResponseModality, SetupAck,
};
use anyhow::{Context, Result, bail};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message as WsMessage,
};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";
/// Rate Gemini Live expects for PCM16 input.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Rate of the PCM16 audio Gemini Live streams back.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub api_key: String,
    pub model: String,
    pub system_instruction: Option<String>,
    pub response_modalities: Vec<ResponseModality>,
    pub endpoint: String,
}

impl LiveConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            system_instruction: None,
            response_modalities: vec![ResponseModality::Audio],
            endpoint: LIVE_ENDPOINT.to_string(),
        }
    }

    fn url(&self) -> String {
        format!("{}?key={}", self.endpoint, self.api_key)
    }

    fn setup_message(&self) -> ClientMessage {
        ClientMessage::Setup(BidiGenerateContentSetup {
            model: self.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: self.response_modalities.clone(),
            },
            system_instruction: self.system_instruction.as_ref().map(|text| Content {
                role: None,
                parts: vec![Part::text(text.clone())],
            }),
        })
    }
}

/// Opens a Live session and completes the setup handshake.
///
/// Returns once the server has acknowledged the setup message, so callers can
/// start sending content straight away.
pub async fn connect(config: &LiveConfig) -> Result<(LiveSender, LiveReceiver)> {
    let (ws_stream, _) = connect_async(config.url())
        .await
        .context("Failed to connect to Gemini Live WebSocket")?;
    let (sink, stream) = ws_stream.split();
    let mut sender = LiveSender { sink };
    let mut receiver = LiveReceiver { stream };

    sender.send(&config.setup_message()).await?;
    tokio::time::timeout(SETUP_TIMEOUT, receiver.wait_for_setup())
        .await
        .context("Timed out waiting for Gemini setup to complete")??;
    info!(model = %config.model, "Gemini Live session ready");

    Ok((sender, receiver))
}

/// Outbound half of a Live session.
pub struct LiveSender {
    sink: SplitSink<WsStream, WsMessage>,
}

impl LiveSender {
    pub async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        let payload = serde_json::to_string(msg)?;
        self.sink
            .send(WsMessage::Text(payload.into()))
            .await
            .context("Failed to send message to Gemini")
    }

    /// Sends one complete user turn.
    pub async fn send_turn(&mut self, parts: Vec<Part>) -> Result<()> {
        self.send(&ClientMessage::ClientContent(
            BidiGenerateContentClientContent {
                turns: vec![Content::user(parts)],
                turn_complete: true,
            },
        ))
        .await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.sink
            .close()
            .await
            .context("Failed to close Gemini WebSocket")
    }
}

/// Inbound half of a Live session.
pub struct LiveReceiver {
    stream: SplitStream<WsStream>,
}

impl LiveReceiver {
    /// Waits for the next JSON frame. Returns `Ok(None)` once the server has
    /// closed the socket.
    pub async fn next_message(&mut self) -> Result<Option<String>> {
        while let Some(frame) = self.stream.next().await {
            match frame.context("Error reading from Gemini WebSocket")? {
                WsMessage::Text(text) => return Ok(Some(text.to_string())),
                // Live sends its JSON as binary frames.
                WsMessage::Binary(bytes) => {
                    let text = String::from_utf8(bytes.to_vec())
                        .context("Gemini sent a non-UTF-8 binary frame")?;
                    return Ok(Some(text));
                }
                WsMessage::Close(frame) => {
                    info!(?frame, "Gemini WebSocket closed by server");
                    return Ok(None);
                }
                other => debug!(?other, "Ignoring control frame"),
            }
        }
        Ok(None)
    }

    async fn wait_for_setup(&mut self) -> Result<()> {
        while let Some(text) = self.next_message().await? {
            match serde_json::from_str::<SetupAck>(&text) {
                Ok(ack) if ack.setup_complete.is_some() => return Ok(()),
                Ok(_) => warn!(%text, "Unexpected message during Gemini setup"),
                Err(e) => warn!(error = %e, %text, "Failed to parse message during Gemini setup"),
            }
        }
        bail!("Gemini closed the connection before completing setup")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::net::TcpListener;

    async fn local_config(listener: &TcpListener) -> LiveConfig {
        let addr = listener.local_addr().unwrap();
        LiveConfig {
            endpoint: format!("ws://{addr}/live"),
            system_instruction: Some("Be brief.".into()),
            ..LiveConfig::new("test-key")
        }
    }

    #[tokio::test]
    async fn test_handshake_then_turn() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = local_config(&listener).await;

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let setup = ws.next().await.unwrap().unwrap();
            let setup: Value = serde_json::from_str(setup.to_text().unwrap()).unwrap();
            ws.send(WsMessage::Binary(br#"{"setupComplete":{}}"#.to_vec().into()))
                .await
                .unwrap();

            let turn = ws.next().await.unwrap().unwrap();
            let turn: Value = serde_json::from_str(turn.to_text().unwrap()).unwrap();
            ws.send(WsMessage::Text(
                r#"{"serverContent":{"turnComplete":true}}"#.into(),
            ))
            .await
            .unwrap();
            ws.close(None).await.unwrap();
            (setup, turn)
        });

        let (mut tx, mut rx) = connect(&config).await.unwrap();
        tx.send_turn(vec![Part::text("hi")]).await.unwrap();

        assert_eq!(
            rx.next_message().await.unwrap().as_deref(),
            Some(r#"{"serverContent":{"turnComplete":true}}"#)
        );
        assert!(rx.next_message().await.unwrap().is_none());

        let (setup, turn) = server.await.unwrap();
        assert_eq!(setup["setup"]["model"], DEFAULT_MODEL);
        assert_eq!(
            setup["setup"]["systemInstruction"]["parts"][0]["text"],
            "Be brief."
        );
        assert_eq!(turn["clientContent"]["turns"][0]["parts"][0]["text"], "hi");
        assert_eq!(turn["clientContent"]["turnComplete"], true);
    }

    #[tokio::test]
    async fn test_close_during_setup_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = local_config(&listener).await;

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _setup = ws.next().await;
            ws.send(WsMessage::Text(r#"{"error":{"message":"bad key"}}"#.into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        });

        assert!(connect(&config).await.is_err());
    }
}
