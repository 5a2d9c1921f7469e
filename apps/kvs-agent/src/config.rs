use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::media::SinkFraming;
use crate::media::relay::DEFAULT_PUSH_TIMEOUT;
use crate::session::SessionOptions;
use crate::signaling::SignalingOptions;
use crate::signaling::client::DEFAULT_PING_INTERVAL;
use crate::signaling::resolver::KinesisVideoResolver;

pub const DEFAULT_REGION: &str = "us-west-2";
pub const DEFAULT_CHANNEL_NAME: &str = "webrtc-kvs-agent-channel";
pub const DEFAULT_STREAM_NAME: &str = "webrtc-kvs-agent-stream";
pub const DEFAULT_LOG_FILTER: &str = "info,kvs_agent=debug";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub region: String,
    pub channel_name: String,
    pub stream_name: String,
    pub client_id: String,
    pub control_plane_endpoint: Option<String>,
    /// `None` means "use the default kvssink pipeline for the stream".
    pub video_pipeline: Option<String>,
    pub audio_pipeline: Option<String>,
    pub sink_framing: SinkFraming,
    pub push_timeout: Duration,
    pub ping_interval: Duration,
    pub trickle_ice: bool,
    pub log_filter: String,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let region = var("AWS_REGION")
            .or_else(|| var("AWS_DEFAULT_REGION"))
            .unwrap_or_else(|| DEFAULT_REGION.into());
        let channel_name = var("KVS_CHANNEL_NAME").unwrap_or_else(|| DEFAULT_CHANNEL_NAME.into());
        let stream_name = var("KVS_STREAM_NAME").unwrap_or_else(|| DEFAULT_STREAM_NAME.into());
        let client_id = var("KVS_CLIENT_ID").unwrap_or_else(default_client_id);
        let control_plane_endpoint = var("KVS_CONTROL_PLANE_ENDPOINT");
        let video_pipeline = var("KVS_VIDEO_PIPELINE");
        let audio_pipeline = var("KVS_AUDIO_PIPELINE");
        let sink_framing = var("KVS_SINK_FRAMING")
            .and_then(|v| SinkFraming::parse(&v))
            .unwrap_or(SinkFraming::Gdp);
        let push_timeout = var("KVS_SINK_PUSH_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_PUSH_TIMEOUT);
        let ping_interval = var("KVS_PING_INTERVAL_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PING_INTERVAL);
        let trickle_ice = var("KVS_TRICKLE_ICE")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
            .unwrap_or(true);
        let log_filter = var("RUST_LOG").unwrap_or_else(|| DEFAULT_LOG_FILTER.into());

        Self {
            region,
            channel_name,
            stream_name,
            client_id,
            control_plane_endpoint,
            video_pipeline,
            audio_pipeline,
            sink_framing,
            push_timeout,
            ping_interval,
            trickle_ice,
            log_filter,
        }
    }

    pub fn control_plane(&self) -> String {
        self.control_plane_endpoint
            .clone()
            .unwrap_or_else(|| KinesisVideoResolver::default_control_plane(&self.region))
    }

    pub fn video_pipeline(&self) -> String {
        self.video_pipeline.clone().unwrap_or_else(|| {
            format!(
                "gst-launch-1.0 -q fdsrc fd=0 ! gdpdepay ! h264parse ! \
                 video/x-h264,stream-format=avc,alignment=au ! \
                 kvssink stream-name={} aws-region={} storage-size=512",
                self.stream_name, self.region
            )
        })
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            signaling: SignalingOptions {
                ping_interval: self.ping_interval,
                trickle_ice: self.trickle_ice,
            },
            push_timeout: self.push_timeout,
        }
    }
}

fn default_client_id() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    format!("viewer-{secs}")
}
