use uuid::Uuid;

/// Failures raised by an upstream engine or channel.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Failed to open upstream channel: {0}")]
    Connect(#[source] anyhow::Error),
    #[error("Failed to send to upstream channel: {0}")]
    Send(#[source] anyhow::Error),
    #[error("Upstream channel is closed")]
    Closed,
}

/// Errors returned by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(Uuid),
    #[error("A turn is already in progress for session {0}")]
    TurnInProgress(Uuid),
    #[error("Audio format mismatch: pending batch is '{expected}', got '{actual}'")]
    MixedAudioFormat { expected: String, actual: String },
    /// The channel could not be opened; the session was not registered.
    #[error("Upstream unavailable: {0}")]
    UpstreamConnect(#[source] UpstreamError),
    #[error("Upstream failure: {0}")]
    Upstream(#[source] UpstreamError),
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let id = Uuid::nil();
        assert_eq!(
            SessionError::NotFound(id).to_string(),
            "Session not found: 00000000-0000-0000-0000-000000000000"
        );
        let err = SessionError::MixedAudioFormat {
            expected: "audio/pcm".into(),
            actual: "audio/wav".into(),
        };
        assert_eq!(
            err.to_string(),
            "Audio format mismatch: pending batch is 'audio/pcm', got 'audio/wav'"
        );
        let err = SessionError::UpstreamConnect(UpstreamError::Connect(anyhow::anyhow!("refused")));
        assert_eq!(
            err.to_string(),
            "Upstream unavailable: Failed to open upstream channel: refused"
        );
    }
}
