//! Decides when an upstream reply is over.
//!
//! Upstreams do not reliably signal the end of a turn, so three signals race:
//! an explicit completion marker, silence for `idle_window` once content has
//! started flowing, and an absolute `hard_timeout` from turn start. The first
//! one to fire wins and the other two are discarded.

use crate::generic_types::{CompletionSignal, MessageFragment};
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_IDLE_WINDOW: Duration = Duration::from_millis(800);
pub const DEFAULT_HARD_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Tuning knobs for turn completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnTimings {
    pub idle_window: Duration,
    pub hard_timeout: Duration,
}

impl Default for TurnTimings {
    fn default() -> Self {
        Self {
            idle_window: DEFAULT_IDLE_WINDOW,
            hard_timeout: DEFAULT_HARD_TIMEOUT,
        }
    }
}

/// State of the three-way race for a single turn.
#[derive(Debug, Clone)]
pub struct TurnCompletionDetector {
    timings: TurnTimings,
    hard_deadline: Instant,
    last_fragment: Option<Instant>,
}

impl TurnCompletionDetector {
    pub fn new(timings: TurnTimings, started: Instant) -> Self {
        Self {
            timings,
            hard_deadline: started + timings.hard_timeout,
            last_fragment: None,
        }
    }

    /// Records an arriving fragment. Returns `Some(Marker)` when it ends the turn.
    pub fn observe(&mut self, fragment: &MessageFragment, now: Instant) -> Option<CompletionSignal> {
        if fragment.completion {
            return Some(CompletionSignal::Marker);
        }
        // The idle clock starts with the first fragment that carries content;
        // after that any arrival pushes it back.
        if fragment.has_content() || self.last_fragment.is_some() {
            self.last_fragment = Some(now);
        }
        None
    }

    /// Starts the idle clock for content that was already collected before
    /// the detector was created.
    pub fn arm_idle(&mut self, now: Instant) {
        self.last_fragment = Some(now);
    }

    /// The earliest pending timer and the signal it represents.
    pub fn next_deadline(&self) -> (Instant, CompletionSignal) {
        match self.last_fragment {
            Some(last) => {
                let idle_deadline = last + self.timings.idle_window;
                if idle_deadline < self.hard_deadline {
                    (idle_deadline, CompletionSignal::Idle)
                } else {
                    (self.hard_deadline, CompletionSignal::HardTimeout)
                }
            }
            None => (self.hard_deadline, CompletionSignal::HardTimeout),
        }
    }
}
