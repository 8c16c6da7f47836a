//! The operation set exposed to transport collaborators.

use crate::{
    aggregator::ResponseAggregator,
    detector::TurnTimings,
    error::{Result, SessionError, UpstreamError},
    generic_types::{HistoryEntry, SessionConfig, TurnInput, TurnResult},
    reaper::{ReaperConfig, SessionReaper},
    registry::SessionRegistry,
    session::{Session, close_channel},
    upstream::{EventSink, UpstreamEngine},
};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{Instant, timeout},
};
use tracing::{info, instrument};
use uuid::Uuid;

/// A point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub owner: String,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub idle_for: Duration,
    pub turn_in_progress: bool,
    pub upstream_alive: bool,
    pub history_len: usize,
}

/// Owns the session registry and drives sessions against one upstream engine.
pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    engine: Arc<dyn UpstreamEngine>,
    aggregator: ResponseAggregator,
}

impl SessionManager {
    pub fn new(engine: Arc<dyn UpstreamEngine>, timings: TurnTimings) -> Self {
        Self::with_registry(Arc::new(SessionRegistry::new()), engine, timings)
    }

    pub fn with_registry(
        registry: Arc<SessionRegistry>,
        engine: Arc<dyn UpstreamEngine>,
        timings: TurnTimings,
    ) -> Self {
        Self {
            registry,
            engine,
            aggregator: ResponseAggregator::new(timings),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn timings(&self) -> TurnTimings {
        self.aggregator.timings()
    }

    /// Starts a reaper over this manager's registry.
    pub fn spawn_reaper(&self, config: ReaperConfig) -> JoinHandle<()> {
        SessionReaper::new(self.registry.clone(), config).spawn()
    }

    /// Opens an upstream channel and registers a new session.
    ///
    /// If the channel cannot be opened, or the initial text cannot be sent,
    /// nothing is registered.
    #[instrument(skip_all, fields(owner = tracing::field::Empty, session_id = tracing::field::Empty))]
    pub async fn connect(&self, owner: impl Into<String>, config: SessionConfig) -> Result<Uuid> {
        let owner = owner.into();
        let id = Uuid::new_v4();
        let span = tracing::Span::current();
        span.record("owner", owner.as_str());
        span.record("session_id", &id.to_string());

        let (events, delivery) = EventSink::new(id);
        let mut channel = self
            .engine
            .open(id, &config, events.clone())
            .await
            .map_err(SessionError::UpstreamConnect)?;

        let mut initial_sent = false;
        if let Some(text) = config.initial_text.clone().filter(|t| !t.is_empty()) {
            let input = TurnInput {
                texts: vec![text],
                ..Default::default()
            };
            let sent = match timeout(self.timings().hard_timeout, channel.send(input)).await {
                Ok(sent) => sent,
                Err(_) => Err(UpstreamError::Send(anyhow!(
                    "upstream did not accept the initial text in time"
                ))),
            };
            if let Err(e) = sent {
                close_channel(id, channel).await;
                return Err(SessionError::UpstreamConnect(e));
            }
            initial_sent = true;
        }

        let session = Arc::new(Session::new(id, owner, config, channel, events, delivery));
        if initial_sent {
            // The first turn collects the reply to the initial text.
            session.expect_reply().await;
        }
        self.registry.insert(session).await;
        info!("Session connected");
        Ok(id)
    }

    /// Queues text for the next turn.
    pub async fn send_text(&self, id: Uuid, text: impl Into<String>) -> Result<()> {
        let session = self.registry.get(id).await?;
        session.append_text(text.into()).await;
        Ok(())
    }

    /// Queues a raw audio chunk for the next turn.
    pub async fn send_audio(&self, id: Uuid, data: Vec<u8>, mime: &str) -> Result<()> {
        let session = self.registry.get(id).await?;
        session.append_audio(data, mime).await
    }

    /// Sends everything queued since the last turn and waits for the reply.
    ///
    /// With nothing queued the call still waits, collecting whatever the
    /// upstream produces on its own until one of the completion signals fires.
    /// Transport failures after the turn has started are reported inside the
    /// result as terminal text rather than as an error.
    #[instrument(skip(self))]
    pub async fn process_turn(&self, id: Uuid) -> Result<TurnResult> {
        let session = self.registry.get(id).await?;
        if !session.upstream_alive().await {
            self.evict(&session).await;
            return Err(SessionError::Upstream(UpstreamError::Closed));
        }

        let _turn = session.begin_turn()?;
        // Fix the turn boundary first, so a reply racing ahead of the send
        // belongs to this turn.
        let mut pending = self.aggregator.begin(&session).await;
        let input = session.drain().await;
        let user_entry = input.as_ref().map(TurnInput::history_entry);
        match input {
            Some(input) => {
                info!(
                    texts = input.texts.len(),
                    audio_chunks = input.audio_chunks.len(),
                    audio_bytes = input.audio_len(),
                    "Starting turn"
                );
                pending.expect_reply();
                if let Err(e) = session.send(input, pending.hard_deadline()).await {
                    session.events().on_error(&e);
                }
            }
            None => info!("Starting turn with no pending input"),
        }

        let result = pending.wait().await;
        session.record_turn(user_entry, &result).await;
        session.touch().await;

        if !session.upstream_alive().await {
            self.evict(&session).await;
        }
        Ok(result)
    }

    /// Closes a session. Unknown or already-closed ids are ignored.
    #[instrument(skip(self))]
    pub async fn close(&self, id: Uuid) {
        if let Some(session) = self.registry.remove(id).await {
            session.shutdown().await;
            info!("Session closed");
        }
    }

    /// Closes every registered session.
    pub async fn close_all(&self) {
        for session in self.registry.snapshot().await {
            self.close(session.id()).await;
        }
    }

    pub async fn info(&self, id: Uuid) -> Result<SessionInfo> {
        let session = self
            .registry
            .peek(id)
            .await
            .ok_or(SessionError::NotFound(id))?;
        let info = describe(&session, Instant::now()).await;
        session.touch().await;
        Ok(info)
    }

    /// Lists the sessions owned by `owner`, oldest first. Listing does not
    /// count as activity on the sessions.
    pub async fn sessions_for(&self, owner: &str) -> Vec<SessionInfo> {
        let now = Instant::now();
        let mut sessions = Vec::new();
        for session in self.registry.snapshot().await {
            if session.owner() == owner {
                sessions.push(describe(&session, now).await);
            }
        }
        sessions.sort_by_key(|info| info.created_at);
        sessions
    }

    pub async fn history(&self, id: Uuid) -> Result<Vec<HistoryEntry>> {
        let session = self.registry.get(id).await?;
        Ok(session.history().await)
    }

    async fn evict(&self, session: &Session) {
        self.registry.remove(session.id()).await;
        session.shutdown().await;
        info!(session_id = %session.id(), "Evicted session with dead upstream");
    }
}

async fn describe(session: &Session, now: Instant) -> SessionInfo {
    SessionInfo {
        id: session.id(),
        owner: session.owner().to_string(),
        model: session.config().model.clone(),
        created_at: session.created_at(),
        idle_for: session.idle_for(now).await,
        turn_in_progress: session.is_turn_in_progress(),
        upstream_alive: session.upstream_alive().await,
        history_len: session.history_len().await,
    }
}
