pub mod webrtc;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::MediaTrack;
use crate::signaling::codec::{IceCandidate, SessionDescription};
use crate::signaling::resolver::ConnectivityServer;

pub use self::webrtc::{WebRtcPeer, WebRtcPeerFactory};

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("offer creation failed: {0}")]
    Offer(String),
    #[error("local description rejected: {0}")]
    LocalDescription(String),
    #[error("remote description rejected: {0}")]
    RemoteDescription(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("peer connection close failed: {0}")]
    Close(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectivityState::New => "new",
            ConnectivityState::Checking => "checking",
            ConnectivityState::Connected => "connected",
            ConnectivityState::Completed => "completed",
            ConnectivityState::Disconnected => "disconnected",
            ConnectivityState::Failed => "failed",
            ConnectivityState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Notifications from the peer connection. Senders only enqueue.
#[derive(Debug)]
pub enum PeerEvent {
    TrackArrived(Box<dyn MediaTrack>),
    ConnectivityStateChanged(ConnectivityState),
}

/// The slice of a peer connection the signaling state machine drives.
#[async_trait]
pub trait PeerConnectionAdapter: Send + Sync {
    /// Registers one receive-only audio and one receive-only video transceiver.
    async fn add_recv_transceivers(&self) -> Result<(), NegotiationError>;
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn set_local_description(&self, offer: SessionDescription)
    -> Result<(), NegotiationError>;
    async fn set_remote_description(
        &self,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;
    /// Resolves once local candidate gathering finished.
    async fn wait_gathering_complete(&self);
    async fn local_description(&self) -> Option<SessionDescription>;
    /// Locally gathered candidates for trickle ICE. Yields the receiver once.
    fn take_local_candidates(&self) -> Option<mpsc::UnboundedReceiver<IceCandidate>>;
    async fn close(&self) -> Result<(), NegotiationError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        servers: &[ConnectivityServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnectionAdapter>, NegotiationError>;
}
