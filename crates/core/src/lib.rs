//! Realtime multimodal session management.
//!
//! A [`SessionManager`] turns client text and audio fragments into turns,
//! forwards them to an upstream streaming engine, and aggregates the
//! incrementally-arriving reply until a turn-completion signal fires. Engines
//! plug in through the [`UpstreamEngine`] trait; idle sessions are reclaimed by
//! the [`SessionReaper`].

pub mod aggregator;
pub mod buffer;
pub mod detector;
pub mod error;
pub mod generic_types;
pub mod manager;
pub mod normalize;
pub mod reaper;
pub mod registry;
pub mod session;
pub mod upstream;
pub mod wav;

pub use detector::TurnTimings;
pub use error::{SessionError, UpstreamError};
pub use generic_types::{
    AudioPart, CompletionSignal, HistoryEntry, MessageFragment, Role, SessionConfig, TurnInput,
    TurnResult,
};
pub use manager::{SessionInfo, SessionManager};
pub use reaper::{ReaperConfig, SessionReaper};
pub use registry::SessionRegistry;
pub use upstream::{EventSink, UpstreamChannel, UpstreamEngine};
