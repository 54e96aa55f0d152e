//! Signaling protocol, per-connection dispatch and a Rust client

pub mod client;
pub mod handler;
pub mod protocol;

pub use client::{ClientError, SignalingClient};
pub use handler::SignalingHandler;
pub use protocol::{
    ClientFrame, Method, ProtocolError, Request, ServerFrame, ServerNotification,
};
