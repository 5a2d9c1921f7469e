use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;

use kvs_agent::auth::DefaultCredentialsChain;
use kvs_agent::media::PipelineSinkFactory;
use kvs_agent::peer::WebRtcPeerFactory;
use kvs_agent::signaling::KinesisVideoResolver;
use kvs_agent::telemetry::init_tracing;
use kvs_agent::{AgentConfig, SessionDeps, SessionOrchestrator};

#[derive(Parser, Debug)]
#[command(
    name = "kvs-agent",
    about = "Join a Kinesis Video signaling channel as a viewer and relay its media",
    version
)]
struct Cli {
    #[arg(long, value_name = "NAME", help = "Signaling channel to join")]
    channel: Option<String>,

    #[arg(long, value_name = "NAME", help = "Video stream the default pipeline writes to")]
    stream: Option<String>,

    #[arg(long, help = "AWS region of the channel")]
    region: Option<String>,

    #[arg(long, value_name = "ID", help = "Viewer client id")]
    client_id: Option<String>,

    #[arg(long, value_name = "FILTER", help = "tracing filter directive")]
    log_filter: Option<String>,
}

impl Cli {
    fn apply(self, cfg: &mut AgentConfig) {
        if let Some(channel) = self.channel {
            cfg.channel_name = channel;
        }
        if let Some(stream) = self.stream {
            cfg.stream_name = stream;
        }
        if let Some(region) = self.region.filter(|r| !r.trim().is_empty()) {
            cfg.region = region;
        }
        if let Some(client_id) = self.client_id {
            cfg.client_id = client_id;
        }
        if let Some(filter) = self.log_filter {
            cfg.log_filter = filter;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut cfg = AgentConfig::from_env();
    cli.apply(&mut cfg);
    init_tracing(&cfg.log_filter);

    tracing::info!(
        region = %cfg.region,
        channel = %cfg.channel_name,
        stream = %cfg.stream_name,
        client_id = %cfg.client_id,
        control_plane = %cfg.control_plane(),
        trickle_ice = cfg.trickle_ice,
        sink_framing = ?cfg.sink_framing,
        push_timeout_ms = cfg.push_timeout.as_millis() as u64,
        "starting kvs-agent"
    );

    let deps = SessionDeps {
        credentials: Arc::new(DefaultCredentialsChain::from_env()),
        resolver: Arc::new(KinesisVideoResolver::new(
            cfg.region.clone(),
            cfg.control_plane(),
        )),
        peers: Arc::new(WebRtcPeerFactory),
        sinks: Arc::new(
            PipelineSinkFactory::new(Some(cfg.video_pipeline()), cfg.audio_pipeline.clone())
                .with_framing(cfg.sink_framing),
        ),
    };
    let orchestrator = SessionOrchestrator::new(deps, cfg.session_options());

    match orchestrator
        .run(&cfg.channel_name, &cfg.client_id, &cfg.region)
        .await
    {
        Ok(()) => {
            tracing::info!("session ended");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(error = %err, "session failed");
            ExitCode::FAILURE
        }
    }
}
