//! Viewer agent for Kinesis Video Streams WebRTC signaling channels.
//!
//! Connects to a channel as a viewer, negotiates a receive-only peer
//! connection with the master and relays every received audio/video frame
//! into a per-kind sink.

pub mod auth;
pub mod config;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod telemetry;

pub use config::AgentConfig;
pub use session::{SessionDeps, SessionError, SessionOptions, SessionOrchestrator};
