//! The per-session record held by the registry.

use crate::{
    buffer::InputBuffer,
    error::{Result, SessionError, UpstreamError},
    generic_types::{HistoryEntry, MessageFragment, Role, SessionConfig, TurnInput, TurnResult},
    upstream::{EventSink, UpstreamChannel},
};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tokio::{
    sync::{Mutex, mpsc},
    time::{Instant, timeout, timeout_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// How long a closing channel may take before it is simply dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

struct SessionState {
    buffer: InputBuffer,
    history: Vec<HistoryEntry>,
    last_activity: Instant,
}

/// Consumer side of the delivery queue.
#[derive(Debug)]
pub(crate) struct Delivery {
    pub(crate) rx: mpsc::UnboundedReceiver<MessageFragment>,
    /// Turns sent upstream whose completion marker has not been collected yet.
    pub(crate) owed_replies: usize,
}

/// One ongoing conversation.
///
/// Buffers, history and the activity timestamp share one lock, so a drain can
/// never interleave with an append. The upstream channel leaves its slot while
/// a send is in flight and for good on shutdown, so closing happens at most
/// once and never queues behind a stalled write.
pub struct Session {
    id: Uuid,
    owner: String,
    created_at: DateTime<Utc>,
    config: SessionConfig,
    state: Mutex<SessionState>,
    turn_in_progress: AtomicBool,
    upstream: Mutex<Option<Box<dyn UpstreamChannel>>>,
    closed: CancellationToken,
    events: EventSink,
    delivery: Mutex<Delivery>,
}

impl Session {
    pub fn new(
        id: Uuid,
        owner: String,
        config: SessionConfig,
        channel: Box<dyn UpstreamChannel>,
        events: EventSink,
        delivery: mpsc::UnboundedReceiver<MessageFragment>,
    ) -> Self {
        Self {
            id,
            owner,
            created_at: Utc::now(),
            config,
            state: Mutex::new(SessionState {
                buffer: InputBuffer::default(),
                history: Vec::new(),
                last_activity: Instant::now(),
            }),
            turn_in_progress: AtomicBool::new(false),
            upstream: Mutex::new(Some(channel)),
            closed: CancellationToken::new(),
            events,
            delivery: Mutex::new(Delivery {
                rx: delivery,
                owed_replies: 0,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub(crate) fn delivery(&self) -> &Mutex<Delivery> {
        &self.delivery
    }

    /// Records a turn that went upstream outside of `process_turn`, such as
    /// the initial text, so its reply is collected by the next turn.
    pub(crate) async fn expect_reply(&self) {
        self.delivery.lock().await.owed_replies += 1;
    }

    /// Refreshes the sliding TTL.
    pub async fn touch(&self) {
        self.state.lock().await.last_activity = Instant::now();
    }

    pub async fn last_activity(&self) -> Instant {
        self.state.lock().await.last_activity
    }

    pub async fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity().await)
    }

    pub async fn append_text(&self, text: String) {
        self.state.lock().await.buffer.append_text(text);
    }

    pub async fn append_audio(&self, data: Vec<u8>, mime: &str) -> Result<()> {
        self.state.lock().await.buffer.append_audio(data, mime)
    }

    /// Atomically takes all pending input; `None` when both queues were empty.
    pub async fn drain(&self) -> Option<TurnInput> {
        self.state.lock().await.buffer.drain()
    }

    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.state.lock().await.history.clone()
    }

    pub async fn history_len(&self) -> usize {
        self.state.lock().await.history.len()
    }

    /// Appends the user contribution (if any) and the reply to the history.
    pub async fn record_turn(&self, user: Option<HistoryEntry>, result: &TurnResult) {
        let mut state = self.state.lock().await;
        state.history.extend(user);
        if !result.texts.is_empty() || !result.audio_parts.is_empty() {
            state.history.push(HistoryEntry {
                role: Role::Assistant,
                text: result.text(),
                audio_bytes: result.audio_len(),
            });
        }
    }

    pub fn is_turn_in_progress(&self) -> bool {
        self.turn_in_progress.load(Ordering::SeqCst)
    }

    /// Claims the session's single turn slot. The slot is released when the
    /// returned guard drops, on every exit path.
    pub fn begin_turn(&self) -> Result<TurnGuard<'_>> {
        self.turn_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| SessionError::TurnInProgress(self.id))?;
        Ok(TurnGuard {
            flag: &self.turn_in_progress,
        })
    }

    /// True while the upstream channel is open and has not reported failure.
    pub async fn upstream_alive(&self) -> bool {
        self.events.is_alive() && !self.closed.is_cancelled()
    }

    /// Writes drained input upstream.
    ///
    /// Gives up with a send error at `deadline`, and with `Closed` as soon as
    /// the session is shut down.
    pub async fn send(&self, input: TurnInput, deadline: Instant) -> Result<(), UpstreamError> {
        let mut channel = self
            .upstream
            .lock()
            .await
            .take()
            .ok_or(UpstreamError::Closed)?;

        let outcome = tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(UpstreamError::Closed),
            sent = timeout_at(deadline, channel.send(input)) => match sent {
                Ok(result) => result,
                Err(_) => Err(UpstreamError::Send(anyhow!(
                    "upstream did not accept the turn before the hard timeout"
                ))),
            },
        };

        // Checked under the slot lock so a concurrent shutdown either finds the
        // channel back in place or leaves it to us to close.
        let mut slot = self.upstream.lock().await;
        if self.closed.is_cancelled() {
            drop(slot);
            close_channel(self.id, channel).await;
        } else {
            *slot = Some(channel);
        }
        outcome
    }

    /// Wakes any waiting aggregator, then closes the upstream channel once.
    pub async fn shutdown(&self) {
        self.events.on_close();
        self.closed.cancel();
        let channel = self.upstream.lock().await.take();
        if let Some(channel) = channel {
            close_channel(self.id, channel).await;
        }
    }
}

/// Closes a channel on a best-effort basis, bounded by [`CLOSE_TIMEOUT`].
pub(crate) async fn close_channel(session_id: Uuid, mut channel: Box<dyn UpstreamChannel>) {
    match timeout(CLOSE_TIMEOUT, channel.close()).await {
        Ok(Ok(())) => debug!(%session_id, "Upstream channel closed"),
        Ok(Err(e)) => {
            warn!(%session_id, error = %e, "Ignoring error while closing upstream channel")
        }
        Err(_) => warn!(%session_id, "Upstream channel did not close in time; dropping it"),
    }
}

/// Releases the turn slot on drop.
pub struct TurnGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    /// Channel that records how often it was closed.
    #[derive(Default, Clone)]
    pub(crate) struct CountingChannel {
        pub closes: Arc<AtomicUsize>,
        pub sent: Arc<std::sync::Mutex<Vec<TurnInput>>>,
    }

    #[async_trait]
    impl UpstreamChannel for CountingChannel {
        async fn send(&mut self, input: TurnInput) -> Result<(), UpstreamError> {
            self.sent.lock().unwrap().push(input);
            Ok(())
        }

        async fn close(&mut self) -> Result<(), UpstreamError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Err(UpstreamError::Closed)
        }
    }

    pub(crate) fn session_with(channel: CountingChannel) -> Session {
        let id = Uuid::new_v4();
        let (events, delivery) = EventSink::new(id);
        Session::new(
            id,
            "owner".into(),
            SessionConfig::default(),
            Box::new(channel),
            events,
            delivery,
        )
    }

    #[tokio::test]
    async fn test_turn_guard_releases_slot() {
        let session = session_with(CountingChannel::default());
        {
            let _guard = session.begin_turn().unwrap();
            assert!(session.is_turn_in_progress());
            assert!(matches!(
                session.begin_turn(),
                Err(SessionError::TurnInProgress(_))
            ));
        }
        assert!(!session.is_turn_in_progress());
        assert!(session.begin_turn().is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_closes_once_and_wakes_waiter() {
        let channel = CountingChannel::default();
        let session = session_with(channel.clone());

        session.shutdown().await;
        session.shutdown().await;

        assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
        assert!(!session.upstream_alive().await);
        let mut delivery = session.delivery().lock().await;
        assert_eq!(delivery.rx.try_recv().unwrap(), MessageFragment::completion());
        assert!(delivery.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let session = session_with(CountingChannel::default());
        session.shutdown().await;
        let deadline = Instant::now() + Duration::from_secs(1);
        let err = session.send(TurnInput::default(), deadline).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Closed));
    }

    /// Channel whose writes never complete.
    struct StalledChannel {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl UpstreamChannel for StalledChannel {
        async fn send(&mut self, _input: TurnInput) -> Result<(), UpstreamError> {
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<(), UpstreamError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn stalled_session(closes: Arc<AtomicUsize>) -> Session {
        let id = Uuid::new_v4();
        let (events, delivery) = EventSink::new(id);
        Session::new(
            id,
            "owner".into(),
            SessionConfig::default(),
            Box::new(StalledChannel { closes }),
            events,
            delivery,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_send_gives_up_at_deadline() {
        let closes = Arc::new(AtomicUsize::new(0));
        let session = stalled_session(closes.clone());

        let started = Instant::now();
        let err = session
            .send(TurnInput::default(), started + Duration::from_secs(15))
            .await
            .unwrap_err();

        assert!(matches!(err, UpstreamError::Send(_)));
        assert_eq!(started.elapsed(), Duration::from_secs(15));
        // The channel went back into its slot and is closed with the session.
        session.shutdown().await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_stalled_send() {
        let closes = Arc::new(AtomicUsize::new(0));
        let session = Arc::new(stalled_session(closes.clone()));

        let sender = {
            let session = session.clone();
            tokio::spawn(async move {
                let deadline = Instant::now() + Duration::from_secs(15);
                session.send(TurnInput::default(), deadline).await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let closing = Instant::now();
        session.shutdown().await;
        assert_eq!(closing.elapsed(), Duration::ZERO);

        let err = sender.await.unwrap().unwrap_err();
        assert!(matches!(err, UpstreamError::Closed));
        assert_eq!(closing.elapsed(), Duration::ZERO);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!session.upstream_alive().await);
    }

    #[tokio::test]
    async fn test_record_turn_appends_history() {
        let session = session_with(CountingChannel::default());
        let input = TurnInput {
            texts: vec!["hi".into(), "there".into()],
            audio_chunks: vec![vec![0; 8]],
            mime: Some("audio/pcm".into()),
        };
        let result = TurnResult {
            messages: vec![MessageFragment::text("hello"), MessageFragment::completion()],
            texts: vec!["hello".into()],
            audio_parts: vec![],
            audio_mime: None,
            completed_by: crate::generic_types::CompletionSignal::Marker,
        };
        session.record_turn(Some(input.history_entry()), &result).await;

        let history = session.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].text, "hi\nthere");
        assert_eq!(history[0].audio_bytes, 8);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].text, "hello");
    }
}
