pub mod client;
pub mod codec;
pub mod resolver;

pub use client::{
    SignalingClient, SignalingError, SignalingHandle, SignalingOptions, SignalingState,
};
pub use codec::{
    Action, DecodeError, EncodeError, IceCandidate, SdpKind, SessionDescription, SignalPayload,
    SignalingMessage, decode, encode,
};
pub use resolver::{
    ConnectionInfo, ConnectionInfoResolver, ConnectivityServer, KinesisVideoResolver,
    ResolveError,
};
