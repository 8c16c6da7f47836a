//! The seam between the session manager and an external streaming engine.
//!
//! An [`UpstreamEngine`] opens one [`UpstreamChannel`] per session. Everything
//! the channel receives is pushed through the session's [`EventSink`] onto an
//! unbounded delivery queue, which the response aggregator drains.

use crate::{
    error::UpstreamError,
    generic_types::{MessageFragment, SessionConfig, TurnInput},
};
use async_trait::async_trait;
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Prefix of the terminal text fragment emitted when the channel fails mid-turn.
pub const UPSTREAM_ERROR_PREFIX: &str = "[upstream error]";

/// Opens streaming channels to an external generative engine.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamEngine: Send + Sync {
    /// Establishes a channel for `session_id`. Inbound traffic must be reported
    /// through `events` until the channel is gone.
    async fn open(
        &self,
        session_id: Uuid,
        config: &SessionConfig,
        events: EventSink,
    ) -> Result<Box<dyn UpstreamChannel>, UpstreamError>;
}

/// One open channel, exclusively owned by a session.
#[async_trait]
pub trait UpstreamChannel: Send + Sync {
    /// Transmits drained input as a single logical turn start.
    async fn send(&mut self, input: TurnInput) -> Result<(), UpstreamError>;

    /// Closes the channel. Callers treat failures as best-effort.
    async fn close(&mut self) -> Result<(), UpstreamError>;
}

/// Producer side of a session's delivery queue, handed to the engine on `open`.
///
/// Error and close notifications always enqueue a completion marker, so a
/// waiting aggregator is guaranteed to wake up.
#[derive(Clone)]
pub struct EventSink {
    session_id: Uuid,
    tx: mpsc::UnboundedSender<MessageFragment>,
    alive: Arc<AtomicBool>,
}

impl EventSink {
    /// Creates a sink and the matching consumer end of the delivery queue.
    pub fn new(session_id: Uuid) -> (Self, mpsc::UnboundedReceiver<MessageFragment>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            session_id,
            tx,
            alive: Arc::new(AtomicBool::new(true)),
        };
        (sink, rx)
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Whether the channel is still usable, i.e. neither errored nor closed.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Delivers normalized fragments in arrival order.
    pub fn on_event(&self, fragments: impl IntoIterator<Item = MessageFragment>) {
        for fragment in fragments {
            debug!(
                session_id = %self.session_id,
                completion = fragment.completion,
                has_text = fragment.text.is_some(),
                has_audio = fragment.audio.is_some(),
                "Delivering upstream fragment"
            );
            self.push(fragment);
        }
    }

    /// Reports an unrecoverable channel failure as a terminal text fragment
    /// followed by a completion marker.
    pub fn on_error(&self, message: impl fmt::Display) {
        if self.alive.swap(false, Ordering::SeqCst) {
            warn!(session_id = %self.session_id, error = %message, "Upstream channel failed");
            self.push(MessageFragment::text(format!(
                "{UPSTREAM_ERROR_PREFIX} {message}"
            )));
            self.push(MessageFragment::completion());
        }
    }

    /// Reports that the channel is gone. Only the first notification enqueues a marker.
    pub fn on_close(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            debug!(session_id = %self.session_id, "Upstream channel closed");
            self.push(MessageFragment::completion());
        }
    }

    fn push(&self, fragment: MessageFragment) {
        // The receiver lives as long as the session; after eviction there is nobody to wake.
        if self.tx.send(fragment).is_err() {
            debug!(session_id = %self.session_id, "Delivery queue dropped; fragment discarded");
        }
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("session_id", &self.session_id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<MessageFragment>) -> Vec<MessageFragment> {
        let mut out = Vec::new();
        while let Ok(f) = rx.try_recv() {
            out.push(f);
        }
        out
    }

    #[test]
    fn test_on_event_preserves_order() {
        let (sink, mut rx) = EventSink::new(Uuid::new_v4());
        sink.on_event(vec![MessageFragment::text("a"), MessageFragment::text("b")]);
        let got = drain(&mut rx);
        assert_eq!(got, vec![MessageFragment::text("a"), MessageFragment::text("b")]);
        assert!(sink.is_alive());
    }

    #[test]
    fn test_on_error_pushes_terminal_text_and_marker_once() {
        let (sink, mut rx) = EventSink::new(Uuid::new_v4());
        sink.on_error("socket reset");
        sink.on_error("again");
        sink.on_close();

        let got = drain(&mut rx);
        assert_eq!(got.len(), 2);
        assert_eq!(
            got[0].text.as_deref(),
            Some("[upstream error] socket reset")
        );
        assert!(got[1].completion);
        assert!(!sink.is_alive());
    }

    #[test]
    fn test_on_close_is_idempotent_across_clones() {
        let (sink, mut rx) = EventSink::new(Uuid::new_v4());
        let other = sink.clone();
        sink.on_close();
        other.on_close();
        assert_eq!(drain(&mut rx), vec![MessageFragment::completion()]);
        assert!(!other.is_alive());
    }
}
