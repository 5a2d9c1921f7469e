pub mod gdp;
pub mod pipeline;
pub mod relay;
pub mod rtp_track;
pub mod sink;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use pipeline::{PipelineSinkFactory, SinkFraming};
pub use relay::{RelayError, RelayStats, TrackRelay};
pub use sink::{FrameSink, RelaySink, SinkError, SinkFactory, SinkRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One depacketized media sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Bytes,
    /// Presentation time relative to the start of the track, when known.
    pub pts: Option<Duration>,
}

/// Timestamp handed to a sink alongside the raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timestamp {
    At(Duration),
    /// Continuation marker: the sink should derive timing itself.
    Unspecified,
}

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("track transport error: {0}")]
    Transport(String),
}

/// An inbound stream handed over by the peer adapter. The adapter may end it
/// at any time; `next_frame` then yields `Ok(None)` or an error.
#[async_trait]
pub trait MediaTrack: Send {
    fn kind(&self) -> TrackKind;
    fn id(&self) -> &str;
    async fn next_frame(&mut self) -> Result<Option<Frame>, TrackError>;
}

impl fmt::Debug for dyn MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("kind", &self.kind())
            .field("id", &self.id())
            .finish()
    }
}
