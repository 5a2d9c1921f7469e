use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::sink::{RelaySink, SinkError, SinkRegistry};
use super::{Frame, MediaTrack, Timestamp};

pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Sink(#[from] SinkError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelayStats {
    pub frames: u64,
    pub bytes: u64,
    pub unspecified_timestamps: u64,
}

/// Pulls frames from one track and pushes them, in order, into the sink for
/// the track's kind.
#[derive(Debug, Clone)]
pub struct TrackRelay {
    push_timeout: Duration,
}

impl Default for TrackRelay {
    fn default() -> Self {
        Self::new(DEFAULT_PUSH_TIMEOUT)
    }
}

impl TrackRelay {
    pub fn new(push_timeout: Duration) -> Self {
        Self { push_timeout }
    }

    pub async fn run(
        &self,
        mut track: Box<dyn MediaTrack>,
        sinks: &SinkRegistry,
    ) -> Result<RelayStats, RelayError> {
        let kind = track.kind();
        let track_id = track.id().to_string();
        tracing::info!(target: "kvs_agent::relay", kind = %kind, track = %track_id, "relay started");

        let mut stats = RelayStats::default();
        let mut clock = PtsClock::default();
        let mut sink: Option<Arc<RelaySink>> = None;

        let outcome = loop {
            let frame = match track.next_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::info!(target: "kvs_agent::relay", kind = %kind, track = %track_id, "track ended");
                    break Ok(());
                }
                Err(err) => {
                    tracing::info!(
                        target: "kvs_agent::relay",
                        kind = %kind,
                        track = %track_id,
                        error = %err,
                        "track pull failed; ending relay"
                    );
                    break Ok(());
                }
            };

            let target = match &sink {
                Some(existing) => Arc::clone(existing),
                None => match sinks.acquire(kind).await {
                    Ok(created) => {
                        sink = Some(Arc::clone(&created));
                        created
                    }
                    Err(err) => break Err(err),
                },
            };

            let (data, timestamp) = clock.translate(frame);
            if timestamp == Timestamp::Unspecified {
                stats.unspecified_timestamps += 1;
            }
            let len = data.len() as u64;
            match tokio::time::timeout(self.push_timeout, target.push(data, timestamp)).await {
                Ok(Ok(())) => {
                    stats.frames += 1;
                    stats.bytes += len;
                }
                Ok(Err(err)) => break Err(err),
                Err(_) => {
                    break Err(SinkError::Stalled {
                        kind,
                        timeout: self.push_timeout,
                    });
                }
            }
        };

        match outcome {
            Ok(()) => {
                if sink.is_some() {
                    sinks.release(kind).await;
                }
                tracing::info!(
                    target: "kvs_agent::relay",
                    kind = %kind,
                    frames = stats.frames,
                    bytes = stats.bytes,
                    "relay finished"
                );
                Ok(stats)
            }
            Err(err) => {
                tracing::error!(target: "kvs_agent::relay", kind = %kind, error = %err, "relay failed");
                Err(err.into())
            }
        }
    }
}

/// Keeps pushed timestamps monotonic.
#[derive(Debug, Default)]
struct PtsClock {
    last: Option<Duration>,
}

impl PtsClock {
    fn translate(&mut self, frame: Frame) -> (bytes::Bytes, Timestamp) {
        let timestamp = match frame.pts {
            Some(pts) if self.last.is_none_or(|last| pts >= last) => {
                self.last = Some(pts);
                Timestamp::At(pts)
            }
            _ => Timestamp::Unspecified,
        };
        (frame.data, timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::rtp_track::RtpClock;
    use bytes::Bytes;

    fn frame(pts: Option<u64>) -> Frame {
        Frame {
            data: Bytes::from_static(b"\x00\x00\x00\x01"),
            pts: pts.map(Duration::from_millis),
        }
    }

    #[test]
    fn timestamps_are_monotonic_or_unspecified() {
        let mut clock = PtsClock::default();
        let stamps: Vec<Timestamp> = [Some(0), Some(33), None, Some(20), Some(33), Some(66)]
            .into_iter()
            .map(|pts| clock.translate(frame(pts)).1)
            .collect();
        assert_eq!(
            stamps,
            vec![
                Timestamp::At(Duration::from_millis(0)),
                Timestamp::At(Duration::from_millis(33)),
                Timestamp::Unspecified,
                Timestamp::Unspecified,
                Timestamp::At(Duration::from_millis(33)),
                Timestamp::At(Duration::from_millis(66)),
            ]
        );
    }

    #[test]
    fn reordered_rtp_timestamps_become_unspecified() {
        let mut rtp = RtpClock::default();
        let mut clock = PtsClock::default();
        let stamps: Vec<Timestamp> = [90_000u32, 93_000, 89_999, 96_000, 99_000, 102_000]
            .into_iter()
            .map(|ts| {
                let pts = rtp.pts(ts, 90_000);
                clock
                    .translate(Frame {
                        data: Bytes::from_static(b"au"),
                        pts,
                    })
                    .1
            })
            .collect();
        assert_eq!(
            stamps,
            vec![
                Timestamp::At(Duration::ZERO),
                Timestamp::At(Duration::from_nanos(33_333_333)),
                Timestamp::Unspecified,
                Timestamp::At(Duration::from_nanos(66_666_666)),
                Timestamp::At(Duration::from_millis(100)),
                Timestamp::At(Duration::from_nanos(133_333_333)),
            ]
        );
    }
}
