//! Parley API Library Crate
//!
//! Configuration, upstream engines, REST handlers, the WebSocket transport and
//! routing for the parley service. The `api` binary is a thin wrapper around
//! this library.

pub mod audio_utils;
pub mod config;
pub mod handlers;
pub mod models;
pub mod provider;
pub mod router;
pub mod state;
pub mod ws;
