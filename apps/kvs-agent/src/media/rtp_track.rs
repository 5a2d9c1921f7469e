use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use webrtc::media::Sample;
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::rtp::packetizer::Depacketizer;
use webrtc::track::track_remote::TrackRemote;

use super::{Frame, MediaTrack, TrackError, TrackKind};

// Packets the sample builder waits for a gap to fill before giving up on it.
const MAX_LATE_PACKETS: u16 = 256;

/// Reassembles RTP packets from a remote track into whole media samples.
pub struct RtpTrack<D: Depacketizer> {
    remote: Arc<TrackRemote>,
    kind: TrackKind,
    id: String,
    builder: SampleBuilder<D>,
    clock_rate: u32,
    clock: RtpClock,
}

impl<D: Depacketizer> RtpTrack<D> {
    pub fn new(remote: Arc<TrackRemote>, kind: TrackKind, depacketizer: D) -> Self {
        let clock_rate = remote.codec().capability.clock_rate;
        let id = remote.id();
        Self {
            builder: SampleBuilder::new(MAX_LATE_PACKETS, depacketizer, clock_rate),
            remote,
            kind,
            id,
            clock_rate,
            clock: RtpClock::default(),
        }
    }

    fn frame_from(&mut self, sample: Sample) -> Frame {
        Frame {
            data: sample.data,
            pts: self.clock.pts(sample.packet_timestamp, self.clock_rate),
        }
    }
}

/// Unwraps 32-bit RTP timestamps into media time since the first sample.
#[derive(Debug, Default)]
pub(crate) struct RtpClock {
    last: Option<u32>,
    ticks: u64,
}

impl RtpClock {
    /// Steps backwards yield `None` and leave the clock where it was.
    pub(crate) fn pts(&mut self, timestamp: u32, clock_rate: u32) -> Option<Duration> {
        if clock_rate == 0 {
            return None;
        }
        if let Some(last) = self.last {
            // Signed distance modulo 2^32: wraparound moves forward, reordering moves back.
            let delta = timestamp.wrapping_sub(last) as i32;
            if delta < 0 {
                return None;
            }
            self.ticks += delta as u64;
        }
        self.last = Some(timestamp);
        Some(Duration::from_nanos(
            self.ticks * 1_000_000_000 / u64::from(clock_rate),
        ))
    }
}

#[async_trait]
impl<D> MediaTrack for RtpTrack<D>
where
    D: Depacketizer + Send + 'static,
{
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>, TrackError> {
        loop {
            if let Some(sample) = self.builder.pop() {
                return Ok(Some(self.frame_from(sample)));
            }
            let (packet, _) = self
                .remote
                .read_rtp()
                .await
                .map_err(|err| TrackError::Transport(err.to_string()))?;
            self.builder.push(packet);
        }
    }
}
