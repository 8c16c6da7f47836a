//! Per-session queues of client input awaiting the next turn.

use crate::{
    error::{Result, SessionError},
    generic_types::TurnInput,
    wav::normalize_mime,
};

/// Pending text fragments and raw audio chunks for one session.
///
/// The owning [`Session`](crate::session::Session) keeps this behind its state
/// lock, so [`InputBuffer::drain`] observes and clears both queues in one step.
#[derive(Debug, Default)]
pub struct InputBuffer {
    texts: Vec<String>,
    audio: Vec<Vec<u8>>,
    mime: Option<String>,
}

impl InputBuffer {
    pub fn append_text(&mut self, text: impl Into<String>) {
        self.texts.push(text.into());
    }

    /// Queues an audio chunk. Every chunk in one pending batch must share a
    /// mime; a chunk declaring a different one is rejected and not queued.
    pub fn append_audio(&mut self, data: Vec<u8>, mime: &str) -> Result<()> {
        let mime = normalize_mime(mime);
        match &self.mime {
            Some(expected) if !self.audio.is_empty() && *expected != mime => {
                return Err(SessionError::MixedAudioFormat {
                    expected: expected.clone(),
                    actual: mime,
                });
            }
            _ => {}
        }
        self.mime = Some(mime);
        self.audio.push(data);
        Ok(())
    }

    /// Most recently declared mime for the pending batch.
    pub fn mime(&self) -> Option<&str> {
        self.mime.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty() && self.audio.is_empty()
    }

    /// Takes everything queued so far. Returns `None` when nothing was pending,
    /// meaning there is no turn to start.
    pub fn drain(&mut self) -> Option<TurnInput> {
        if self.is_empty() {
            return None;
        }
        let audio_chunks = std::mem::take(&mut self.audio);
        let mime = if audio_chunks.is_empty() {
            None
        } else {
            self.mime.take()
        };
        Some(TurnInput {
            texts: std::mem::take(&mut self.texts),
            audio_chunks,
            mime,
        })
    }
}
