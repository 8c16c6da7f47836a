//! In-memory table of live sessions.

use crate::{
    error::{Result, SessionError},
    session::Session,
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Maps session ids to their records. A session is present strictly between
/// `connect` and its close or eviction.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: Arc<Session>) {
        let id = session.id();
        self.sessions.write().await.insert(id, session);
        debug!(session_id = %id, "Session registered");
    }

    /// Looks up a session and refreshes its last-activity timestamp.
    pub async fn get(&self, id: Uuid) -> Result<Arc<Session>> {
        let session = self.peek(id).await.ok_or(SessionError::NotFound(id))?;
        session.touch().await;
        Ok(session)
    }

    /// Looks up a session without counting as activity.
    pub async fn peek(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Removes a session. Removing an unknown id is a no-op.
    pub async fn remove(&self, id: Uuid) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(&id);
        if removed.is_some() {
            debug!(session_id = %id, "Session unregistered");
        }
        removed
    }

    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
