use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::auth::{CredentialsError, CredentialsProvider, SigningError, UrlSigner};
use crate::media::relay::DEFAULT_PUSH_TIMEOUT;
use crate::media::{RelayError, SinkFactory, SinkRegistry, TrackKind, TrackRelay};
use crate::peer::{NegotiationError, PeerConnectionFactory, PeerEvent};
use crate::signaling::{
    ConnectionInfoResolver, ResolveError, SignalingClient, SignalingError, SignalingOptions,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("credentials unavailable: {0}")]
    CredentialsUnavailable(#[from] CredentialsError),
    #[error("connection info lookup failed: {0}")]
    Resolve(#[from] ResolveError),
    #[error("channel url signing failed: {0}")]
    Signing(#[from] SigningError),
    #[error("peer connection failed: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("media relay failed: {0}")]
    Relay(#[from] RelayError),
}

/// External collaborators the session is wired from.
#[derive(Clone)]
pub struct SessionDeps {
    pub credentials: Arc<dyn CredentialsProvider>,
    pub resolver: Arc<dyn ConnectionInfoResolver>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub sinks: Arc<dyn SinkFactory>,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub signaling: SignalingOptions,
    pub push_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            signaling: SignalingOptions::default(),
            push_timeout: DEFAULT_PUSH_TIMEOUT,
        }
    }
}

pub struct SessionOrchestrator {
    deps: SessionDeps,
    options: SessionOptions,
}

impl SessionOrchestrator {
    pub fn new(deps: SessionDeps, options: SessionOptions) -> Self {
        Self { deps, options }
    }

    /// Runs one viewer session until the channel closes, a fatal error occurs
    /// or the process is asked to stop (Ctrl-C or SIGTERM).
    pub async fn run(
        &self,
        channel_name: &str,
        client_id: &str,
        region: &str,
    ) -> Result<(), SessionError> {
        self.run_until(channel_name, client_id, region, shutdown_signal())
            .await
    }

    pub async fn run_until<F>(
        &self,
        channel_name: &str,
        client_id: &str,
        region: &str,
        shutdown: F,
    ) -> Result<(), SessionError>
    where
        F: Future<Output = ()>,
    {
        tracing::info!(
            target: "kvs_agent::session",
            channel = %channel_name,
            client_id = %client_id,
            region = %region,
            "starting viewer session"
        );
        let credentials = self.deps.credentials.credentials().await.map_err(|err| {
            tracing::error!(target: "kvs_agent::session", error = %err, "no usable credentials");
            err
        })?;
        let info = self
            .deps
            .resolver
            .resolve(channel_name, client_id, &credentials)
            .await?;
        let signed = UrlSigner::new(region).sign(
            &info.wss_endpoint,
            &info.channel_arn,
            client_id,
            &credentials,
        )?;
        tracing::debug!(target: "kvs_agent::session", expires_at = %signed.expires_at(), "channel url signed");

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let adapter = self.deps.peers.create(&info.ice_servers, events_tx).await?;
        let sinks = Arc::new(SinkRegistry::new(Arc::clone(&self.deps.sinks)));
        let relay = TrackRelay::new(self.options.push_timeout);
        let client = SignalingClient::new(Arc::clone(&adapter), self.options.signaling.clone());
        let handle = client.handle();

        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<RelayError>();
        let mut relays: HashMap<TrackKind, JoinHandle<()>> = HashMap::new();
        let mut first_error: Option<SessionError> = None;
        let mut shutdown_requested = false;

        let connect = client.connect(signed);
        tokio::pin!(connect);
        tokio::pin!(shutdown);

        let outcome = loop {
            tokio::select! {
                result = &mut connect => break result,
                Some(event) = events_rx.recv() => match event {
                    PeerEvent::TrackArrived(track) => {
                        let kind = track.kind();
                        if relays.get(&kind).is_some_and(|task| !task.is_finished()) {
                            tracing::warn!(
                                target: "kvs_agent::session",
                                kind = %kind,
                                track = %track.id(),
                                "relay already active for kind; dropping track"
                            );
                            continue;
                        }
                        let relay = relay.clone();
                        let sinks = Arc::clone(&sinks);
                        let fatal_tx = fatal_tx.clone();
                        relays.insert(kind, tokio::spawn(async move {
                            if let Err(err) = relay.run(track, &sinks).await {
                                let _ = fatal_tx.send(err);
                            }
                        }));
                    }
                    PeerEvent::ConnectivityStateChanged(state) => {
                        tracing::info!(target: "kvs_agent::session", state = %state, "connectivity state changed");
                    }
                },
                Some(err) = fatal_rx.recv() => {
                    first_error.get_or_insert(SessionError::Relay(err));
                    handle.close();
                }
                _ = &mut shutdown, if !shutdown_requested => {
                    tracing::info!(target: "kvs_agent::session", "shutdown requested");
                    shutdown_requested = true;
                    handle.close();
                }
            }
        };

        // Teardown: relays, then sinks, then the peer connection.
        for (kind, task) in relays.drain() {
            task.abort();
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    tracing::warn!(target: "kvs_agent::session", kind = %kind, error = %err, "relay task panicked");
                }
            }
        }
        while let Ok(err) = fatal_rx.try_recv() {
            first_error.get_or_insert(SessionError::Relay(err));
        }
        sinks.close_all().await;
        if let Err(err) = adapter.close().await {
            tracing::warn!(target: "kvs_agent::session", error = %err, "peer connection close failed");
        }
        tracing::info!(target: "kvs_agent::session", "session torn down");

        match first_error {
            Some(err) => Err(err),
            None => outcome.map_err(SessionError::from),
        }
    }
}

/// Resolves on Ctrl-C or, on unix, SIGTERM. The SIGTERM handler is installed
/// before this returns, so a signal sent right after is not lost.
pub fn shutdown_signal() -> impl Future<Output = ()> + Send + 'static {
    #[cfg(unix)]
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(err) => {
            tracing::warn!(target: "kvs_agent::session", error = %err, "cannot listen for SIGTERM");
            None
        }
    };

    async move {
        let ctrl_c = async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        #[cfg(unix)]
        let terminate = async {
            match sigterm.as_mut() {
                Some(stream) => {
                    stream.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!(target: "kvs_agent::session", "received Ctrl-C");
            }
            _ = terminate => {
                tracing::info!(target: "kvs_agent::session", "received SIGTERM");
            }
        }
    }
}
