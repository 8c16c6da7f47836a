//! A small client for the Gemini Live bidirectional streaming API.

pub mod client;
pub mod types;

pub use client::{
    DEFAULT_MODEL, INPUT_SAMPLE_RATE, LIVE_ENDPOINT, LiveConfig, LiveReceiver, LiveSender,
    OUTPUT_SAMPLE_RATE, connect,
};
pub use types::{Blob, ClientMessage, Content, Part, ResponseModality};
