//! SFU Signal - signaling and session orchestration for a WebRTC SFU
//!
//! Peers connect over WebSocket, negotiate send and receive transports
//! against a media forwarding engine, and get routed to each other's
//! producers.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod ids;
pub mod session;
pub mod signaling;
pub mod state;
pub mod web;

pub use error::{AppError, Result};
