//! Study Buddy API Library Crate
//!
//! This library contains the web service around the study buddy core: the
//! application state, REST handlers, the WebSocket session bridge, transcription
//! and routing. The `api` binary is a thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod transcription;
pub mod ws;
