//! Sinks backed by an external pipeline process that reads frames on stdin,
//! e.g. a `gst-launch-1.0 fdsrc ! gdpdepay ! ... ! kvssink` chain.

use async_trait::async_trait;
use bytes::Bytes;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command as TokioCommand};

use super::gdp;
use super::sink::{FrameSink, SinkError, SinkFactory};
use super::{Timestamp, TrackKind};

const EXIT_GRACE: Duration = Duration::from_secs(5);

/// How frames are laid out on the pipeline's stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkFraming {
    /// Payload bytes back to back; timestamps are dropped.
    #[default]
    Raw,
    /// GDP packets carrying caps and per-buffer timestamps, for `gdpdepay`.
    Gdp,
}

impl SinkFraming {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "raw" => Some(SinkFraming::Raw),
            "gdp" => Some(SinkFraming::Gdp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineSinkFactory {
    video: Option<String>,
    audio: Option<String>,
    framing: SinkFraming,
}

impl PipelineSinkFactory {
    pub fn new(video: Option<String>, audio: Option<String>) -> Self {
        Self {
            video,
            audio,
            framing: SinkFraming::Raw,
        }
    }

    pub fn with_framing(mut self, framing: SinkFraming) -> Self {
        self.framing = framing;
        self
    }

    fn pipeline_for(&self, kind: TrackKind) -> Option<&str> {
        let pipeline = match kind {
            TrackKind::Video => self.video.as_deref(),
            TrackKind::Audio => self.audio.as_deref(),
        };
        pipeline.filter(|pipeline| !pipeline.trim().is_empty())
    }
}

#[async_trait]
impl SinkFactory for PipelineSinkFactory {
    async fn create_sink(&self, kind: TrackKind) -> Result<Box<dyn FrameSink>, SinkError> {
        match self.pipeline_for(kind) {
            Some(pipeline) => Ok(Box::new(CommandSink::spawn(kind, pipeline, self.framing)?)),
            None => {
                tracing::info!(
                    target: "kvs_agent::relay",
                    kind = %kind,
                    "no pipeline configured; discarding frames"
                );
                Ok(Box::new(DiscardSink::new(kind)))
            }
        }
    }
}

/// Writes each frame to the stdin of `sh -c <pipeline>`.
pub struct CommandSink {
    kind: TrackKind,
    framing: SinkFraming,
    child: Child,
    stdin: Option<ChildStdin>,
    caps_sent: bool,
}

impl CommandSink {
    pub fn spawn(kind: TrackKind, pipeline: &str, framing: SinkFraming) -> Result<Self, SinkError> {
        let mut command = TokioCommand::new("sh");
        command.arg("-c").arg(pipeline);
        command.stdin(Stdio::piped());
        command.stdout(Stdio::null());
        command.stderr(Stdio::inherit());
        command.kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| SinkError::Create {
            kind,
            reason: format!("failed to spawn pipeline: {err}"),
        })?;
        // kill_on_drop reaps the child if stdin could not be captured.
        let stdin = child.stdin.take().ok_or_else(|| SinkError::Create {
            kind,
            reason: "pipeline stdin unavailable".into(),
        })?;
        tracing::info!(
            target: "kvs_agent::relay",
            kind = %kind,
            pid = ?child.id(),
            pipeline = %pipeline,
            framing = ?framing,
            "pipeline started"
        );
        Ok(Self {
            kind,
            framing,
            child,
            stdin: Some(stdin),
            caps_sent: false,
        })
    }
}

#[async_trait]
impl FrameSink for CommandSink {
    async fn push(&mut self, data: Bytes, timestamp: Timestamp) -> Result<(), SinkError> {
        let kind = self.kind;
        let stdin = self.stdin.as_mut().ok_or(SinkError::Closed { kind })?;
        tracing::trace!(target: "kvs_agent::relay", kind = %kind, len = data.len(), timestamp = ?timestamp, "push");
        let rejected = |reason: String| SinkError::Rejected { kind, reason };

        if self.framing == SinkFraming::Gdp {
            if !self.caps_sent {
                stdin
                    .write_all(&gdp::caps_packet(gdp::caps_for(kind)))
                    .await
                    .map_err(|err| rejected(err.to_string()))?;
                self.caps_sent = true;
            }
            let len = u32::try_from(data.len())
                .map_err(|_| rejected(format!("frame of {} bytes is too large", data.len())))?;
            stdin
                .write_all(&gdp::buffer_header(len, timestamp))
                .await
                .map_err(|err| rejected(err.to_string()))?;
        }
        stdin
            .write_all(&data)
            .await
            .map_err(|err| rejected(err.to_string()))
    }

    async fn close(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }
        match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(target: "kvs_agent::relay", kind = %self.kind, status = %status, "pipeline exited");
            }
            Ok(Err(err)) => {
                tracing::warn!(target: "kvs_agent::relay", kind = %self.kind, error = %err, "pipeline wait failed");
            }
            Err(_) => {
                tracing::warn!(target: "kvs_agent::relay", kind = %self.kind, "pipeline did not exit; killing");
                let _ = self.child.kill().await;
            }
        }
    }
}

/// Accepts and drops every frame.
#[derive(Debug)]
pub struct DiscardSink {
    kind: TrackKind,
    frames: u64,
}

impl DiscardSink {
    pub fn new(kind: TrackKind) -> Self {
        Self { kind, frames: 0 }
    }
}

#[async_trait]
impl FrameSink for DiscardSink {
    async fn push(&mut self, _data: Bytes, _timestamp: Timestamp) -> Result<(), SinkError> {
        self.frames += 1;
        Ok(())
    }

    async fn close(&mut self) {
        tracing::debug!(target: "kvs_agent::relay", kind = %self.kind, frames = self.frames, "discard sink closed");
    }
}
