//! Collects a turn's reply from the delivery queue.

use crate::{
    detector::{TurnCompletionDetector, TurnTimings},
    generic_types::{CompletionSignal, MessageFragment, TurnResult},
    session::{Delivery, Session},
};
use tokio::{
    sync::{MutexGuard, mpsc::error::TryRecvError},
    time::{Instant, sleep_until},
};
use tracing::{debug, info, instrument};

/// Accumulates fragments into a [`TurnResult`].
#[derive(Debug, Default)]
struct TurnAccumulator {
    messages: Vec<MessageFragment>,
    texts: Vec<String>,
    audio_parts: Vec<Vec<u8>>,
    audio_mime: Option<String>,
}

impl TurnAccumulator {
    fn push(&mut self, fragment: MessageFragment) {
        if let Some(text) = fragment.text.as_ref().filter(|t| !t.is_empty()) {
            self.texts.push(text.clone());
        }
        if let Some(audio) = fragment.audio.as_ref().filter(|a| !a.data.is_empty()) {
            self.audio_parts.push(audio.data.clone());
            self.audio_mime = Some(audio.mime.clone());
        }
        self.messages.push(fragment);
    }

    fn has_content(&self) -> bool {
        !self.texts.is_empty() || !self.audio_parts.is_empty()
    }

    fn finish(mut self, completed_by: CompletionSignal) -> TurnResult {
        if !self.messages.last().is_some_and(|m| m.completion) {
            self.messages.push(MessageFragment::completion());
        }
        TurnResult {
            messages: self.messages,
            texts: self.texts,
            audio_parts: self.audio_parts,
            audio_mime: self.audio_mime,
            completed_by,
        }
    }
}

/// Drains a session's delivery queue under the supervision of a
/// [`TurnCompletionDetector`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseAggregator {
    timings: TurnTimings,
}

impl ResponseAggregator {
    pub fn new(timings: TurnTimings) -> Self {
        Self { timings }
    }

    pub fn timings(&self) -> TurnTimings {
        self.timings
    }

    /// Fixes the start of a turn, before anything is sent upstream.
    ///
    /// Everything already queued is flushed into the new turn. Content is
    /// carried over. A completion marker settles an earlier reply that is still
    /// owed (the initial text, say) and is dropped as stale otherwise. A marker
    /// left by a failed or closed channel ends the turn at once. The delivery
    /// queue stays locked until [`PendingTurn::wait`] returns, so a reply that
    /// races ahead of the send is collected rather than flushed.
    /// The caller must hold the session's turn slot.
    pub async fn begin<'a>(&self, session: &'a Session) -> PendingTurn<'a> {
        let started = Instant::now();
        let mut delivery = session.delivery().lock().await;
        let mut acc = TurnAccumulator::default();

        let mut carried = 0usize;
        let mut settled = 0usize;
        let mut dropped = 0usize;
        let mut completed_early = None;
        while completed_early.is_none() {
            let fragment = match delivery.rx.try_recv() {
                Ok(fragment) => fragment,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            };
            if fragment.has_content() {
                carried += 1;
            }
            if !fragment.completion {
                acc.push(fragment);
                continue;
            }
            // The sink flips its liveness before enqueueing a failure marker.
            if !session.events().is_alive() {
                completed_early = Some(CompletionSignal::Marker);
                acc.push(fragment);
                continue;
            }
            if delivery.owed_replies > 0 {
                delivery.owed_replies -= 1;
                settled += 1;
            } else {
                dropped += 1;
            }
            if fragment.has_content() {
                acc.push(MessageFragment {
                    completion: false,
                    ..fragment
                });
            }
        }
        if carried > 0 || settled > 0 || dropped > 0 {
            debug!(carried, settled, dropped, "Flushed fragments queued before the turn");
        }

        PendingTurn {
            session,
            delivery,
            acc,
            timings: self.timings,
            started,
            settled,
            completed_early,
        }
    }
}

/// A turn whose boundary has been fixed but whose reply is still coming.
pub struct PendingTurn<'a> {
    session: &'a Session,
    delivery: MutexGuard<'a, Delivery>,
    acc: TurnAccumulator,
    timings: TurnTimings,
    started: Instant,
    /// Earlier replies whose markers were found while flushing.
    settled: usize,
    completed_early: Option<CompletionSignal>,
}

impl PendingTurn<'_> {
    /// When the turn gives up, sending included.
    pub fn hard_deadline(&self) -> Instant {
        self.started + self.timings.hard_timeout
    }

    /// Registers input about to be sent, so its completion marker ends the turn.
    pub fn expect_reply(&mut self) {
        self.delivery.owed_replies += 1;
    }

    /// Waits until the turn completes and returns everything received.
    ///
    /// With replies still owed, the turn ends once the last of their markers
    /// arrives. Otherwise any marker ends it. If the flushed markers already
    /// settled every owed reply and nothing new was sent, the turn is over
    /// immediately.
    #[instrument(name = "wait_for_turn", skip_all, fields(session_id = %self.session.id()))]
    pub async fn wait(mut self) -> TurnResult {
        let completed_by = match self.completed_early {
            Some(signal) => signal,
            None if self.settled > 0 && self.delivery.owed_replies == 0 => CompletionSignal::Marker,
            None => {
                let mut detector = TurnCompletionDetector::new(self.timings, self.started);
                if self.acc.has_content() {
                    detector.arm_idle(Instant::now());
                }
                let delivery = &mut *self.delivery;
                loop {
                    let (deadline, timer_signal) = detector.next_deadline();
                    tokio::select! {
                        biased;
                        received = delivery.rx.recv() => match received {
                            Some(mut fragment) => {
                                let is_marker = fragment.completion;
                                if is_marker {
                                    let owed = delivery.owed_replies.saturating_sub(1);
                                    delivery.owed_replies = owed;
                                    // Another reply of this turn is still on its way.
                                    if owed > 0 && self.session.events().is_alive() {
                                        fragment.completion = false;
                                    }
                                }
                                let signal = detector.observe(&fragment, Instant::now());
                                if !is_marker || fragment.completion || fragment.has_content() {
                                    self.acc.push(fragment);
                                }
                                if let Some(signal) = signal {
                                    break signal;
                                }
                            }
                            // Every sender is gone; nothing more can ever arrive.
                            None => break CompletionSignal::Marker,
                        },
                        _ = sleep_until(deadline) => break timer_signal,
                    }
                }
            }
        };
        // Markers still owed now belong to a finished turn and will be dropped.
        self.delivery.owed_replies = 0;

        let result = self.acc.finish(completed_by);
        info!(
            ?completed_by,
            fragments = result.messages.len(),
            text_parts = result.texts.len(),
            audio_bytes = result.audio_len(),
            "Turn completed"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::{CountingChannel, session_with};
    use std::time::Duration;

    fn aggregator() -> ResponseAggregator {
        ResponseAggregator::new(TurnTimings {
            idle_window: Duration::from_millis(800),
            hard_timeout: Duration::from_secs(15),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_marker_completes_turn() {
        let session = session_with(CountingChannel::default());
        session.events().on_event(vec![
            MessageFragment::text("Hel"),
            MessageFragment::audio(vec![1, 2], "audio/pcm;rate=24000"),
        ]);

        let events = session.events().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            events.on_event(vec![MessageFragment::text("lo"), MessageFragment::completion()]);
        });

        let result = aggregator().begin(&session).await.wait().await;
        assert_eq!(result.completed_by, CompletionSignal::Marker);
        assert_eq!(result.texts, vec!["Hel", "lo"]);
        assert_eq!(result.audio_parts, vec![vec![1, 2]]);
        assert_eq!(result.audio_mime.as_deref(), Some("audio/pcm;rate=24000"));
        assert!(result.messages.last().unwrap().completion);
        assert_eq!(result.messages.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_silence_completes_turn_with_synthetic_marker() {
        let session = session_with(CountingChannel::default());
        let events = session.events().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            events.on_event(vec![MessageFragment::text("partial")]);
        });

        let started = Instant::now();
        let result = aggregator().begin(&session).await.wait().await;
        assert_eq!(result.completed_by, CompletionSignal::Idle);
        assert_eq!(result.texts, vec!["partial"]);
        assert_eq!(result.messages.last(), Some(&MessageFragment::completion()));
        assert_eq!(started.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_timeout_yields_empty_result() {
        let session = session_with(CountingChannel::default());
        let started = Instant::now();
        let result = aggregator().begin(&session).await.wait().await;

        assert_eq!(result.completed_by, CompletionSignal::HardTimeout);
        assert!(result.texts.is_empty());
        assert_eq!(result.messages, vec![MessageFragment::completion()]);
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leftovers_are_carried_but_stale_markers_dropped() {
        let session = session_with(CountingChannel::default());
        session.events().on_event(vec![
            MessageFragment::text("tail of last reply"),
            MessageFragment::completion(),
        ]);

        let events = session.events().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            events.on_event(vec![MessageFragment::text("fresh"), MessageFragment::completion()]);
        });

        let result = aggregator().begin(&session).await.wait().await;
        assert_eq!(result.completed_by, CompletionSignal::Marker);
        assert_eq!(result.texts, vec!["tail of last reply", "fresh"]);
        assert_eq!(result.messages.iter().filter(|m| m.completion).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_before_wait_completes_immediately() {
        let session = session_with(CountingChannel::default());
        session.events().on_error("send failed");

        let started = Instant::now();
        let result = aggregator().begin(&session).await.wait().await;
        assert_eq!(result.completed_by, CompletionSignal::Marker);
        assert_eq!(result.texts, vec!["[upstream error] send failed"]);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_unblocks_waiter() {
        let session = std::sync::Arc::new(session_with(CountingChannel::default()));
        let closer = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            closer.shutdown().await;
        });

        let started = Instant::now();
        let result = aggregator().begin(&session).await.wait().await;
        assert_eq!(result.completed_by, CompletionSignal::Marker);
        assert_eq!(result.messages, vec![MessageFragment::completion()]);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_queued_during_send_is_collected() {
        let session = session_with(CountingChannel::default());
        let mut turn = aggregator().begin(&session).await;
        turn.expect_reply();
        // An upstream that answers before its send call even returns.
        session.events().on_event(vec![
            MessageFragment::text("hi back"),
            MessageFragment::completion(),
        ]);

        let started = Instant::now();
        let result = turn.wait().await;
        assert_eq!(result.completed_by, CompletionSignal::Marker);
        assert_eq!(result.texts, vec!["hi back"]);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_owed_reply_settled_before_turn_completes_it() {
        let session = session_with(CountingChannel::default());
        session.expect_reply().await;
        session.events().on_event(vec![
            MessageFragment::text("Hello, I am your tutor."),
            MessageFragment::completion(),
        ]);

        let started = Instant::now();
        let result = aggregator().begin(&session).await.wait().await;
        assert_eq!(result.completed_by, CompletionSignal::Marker);
        assert_eq!(result.texts, vec!["Hello, I am your tutor."]);
        assert_eq!(result.messages.iter().filter(|m| m.completion).count(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_waits_for_every_owed_marker() {
        let session = session_with(CountingChannel::default());
        session.expect_reply().await;
        let mut turn = aggregator().begin(&session).await;
        turn.expect_reply();

        let events = session.events().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            events.on_event(vec![MessageFragment::text("first"), MessageFragment::completion()]);
            tokio::time::sleep(Duration::from_millis(100)).await;
            events.on_event(vec![MessageFragment::text("second"), MessageFragment::completion()]);
        });

        let started = Instant::now();
        let result = turn.wait().await;
        assert_eq!(result.completed_by, CompletionSignal::Marker);
        assert_eq!(result.texts, vec!["first", "second"]);
        assert_eq!(result.messages.iter().filter(|m| m.completion).count(), 1);
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_carried_content_arms_idle_window() {
        let session = session_with(CountingChannel::default());
        session.events().on_event(vec![MessageFragment::text("tail without a marker")]);

        let started = Instant::now();
        let result = aggregator().begin(&session).await.wait().await;
        assert_eq!(result.completed_by, CompletionSignal::Idle);
        assert_eq!(result.texts, vec!["tail without a marker"]);
        assert_eq!(started.elapsed(), Duration::from_millis(800));
    }
}
