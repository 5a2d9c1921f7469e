use futures_util::{Sink, SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};

use super::codec::{self, Action, EncodeError, IceCandidate, SessionDescription, SignalPayload};
use crate::auth::SignedChannelUrl;
use crate::peer::{NegotiationError, PeerConnectionAdapter};

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Idle,
    Connecting,
    Negotiating,
    Open,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SignalingOptions {
    pub ping_interval: Duration,
    /// Send local candidates as they are gathered instead of waiting for
    /// gathering to finish before the offer goes out.
    pub trickle_ice: bool,
}

impl Default for SignalingOptions {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            trickle_ice: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signed channel url expired at {0}")]
    UrlExpired(OffsetDateTime),
    #[error("signaling client was already connected")]
    AlreadyConnected,
    #[error("signaling channel error: {0}")]
    Channel(#[from] WsError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

struct Shared {
    state: watch::Sender<SignalingState>,
    close: watch::Sender<bool>,
}

impl Shared {
    fn request_close(&self) {
        self.close.send_replace(true);
        self.state.send_if_modified(|state| {
            if *state == SignalingState::Idle {
                *state = SignalingState::Closed;
                true
            } else {
                false
            }
        });
    }
}

/// Requests a local close of the channel from outside the receive loop.
#[derive(Clone)]
pub struct SignalingHandle {
    shared: Arc<Shared>,
}

impl SignalingHandle {
    pub fn close(&self) {
        self.shared.request_close();
    }

    pub fn state(&self) -> SignalingState {
        *self.shared.state.borrow()
    }
}

/// Receive-loop bookkeeping for one negotiation.
#[derive(Debug, Default)]
pub(crate) struct Negotiation {
    pending_candidates: VecDeque<IceCandidate>,
    remote_description_set: bool,
}

pub struct SignalingClient {
    adapter: Arc<dyn PeerConnectionAdapter>,
    options: SignalingOptions,
    shared: Arc<Shared>,
}

impl SignalingClient {
    pub fn new(adapter: Arc<dyn PeerConnectionAdapter>, options: SignalingOptions) -> Self {
        let (state, _) = watch::channel(SignalingState::Idle);
        let (close, _) = watch::channel(false);
        Self {
            adapter,
            options,
            shared: Arc::new(Shared { state, close }),
        }
    }

    pub fn handle(&self) -> SignalingHandle {
        SignalingHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> SignalingState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SignalingState> {
        self.shared.state.subscribe()
    }

    pub fn close(&self) {
        self.shared.request_close();
    }

    fn set_state(&self, next: SignalingState) {
        let previous = self.shared.state.send_replace(next);
        if previous != next {
            tracing::info!(
                target: "kvs_agent::signaling",
                from = ?previous,
                to = ?next,
                "signaling state changed"
            );
        }
    }

    /// Opens the channel and runs the receive loop until the channel closes.
    pub async fn connect(&self, url: SignedChannelUrl) -> Result<(), SignalingError> {
        match self.state() {
            SignalingState::Idle => {}
            SignalingState::Closed if *self.shared.close.borrow() => {
                tracing::info!(
                    target: "kvs_agent::signaling",
                    "close requested before connect; not opening channel"
                );
                return Ok(());
            }
            _ => return Err(SignalingError::AlreadyConnected),
        }
        if url.is_expired() {
            self.set_state(SignalingState::Closed);
            return Err(SignalingError::UrlExpired(url.expires_at()));
        }

        self.set_state(SignalingState::Connecting);
        let result = self.run_channel(url).await;
        self.set_state(SignalingState::Closed);
        if let Err(err) = &result {
            tracing::error!(target: "kvs_agent::signaling", error = %err, "signaling channel failed");
        }
        result
    }

    async fn run_channel(&self, url: SignedChannelUrl) -> Result<(), SignalingError> {
        let url = url.into_url();
        let host = url.host_str().unwrap_or_default().to_string();
        let mut close_rx = self.shared.close.subscribe();

        let connected = tokio::select! {
            result = connect_async(url.as_str()) => result?,
            _ = close_requested(&mut close_rx) => return Ok(()),
        };
        let (ws_stream, _) = connected;
        tracing::debug!(target: "kvs_agent::signaling", host = %host, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        self.set_state(SignalingState::Negotiating);
        let mut local_candidates = if self.options.trickle_ice {
            self.adapter.take_local_candidates()
        } else {
            None
        };
        let outcome = match self.send_offer(&mut ws_write).await {
            Ok(()) => {
                self.receive_loop(&mut ws_write, &mut ws_read, &mut local_candidates, &mut close_rx)
                    .await
            }
            Err(err) => Err(err),
        };

        if let Err(err) = ws_write.close().await {
            tracing::debug!(target: "kvs_agent::signaling", error = %err, "websocket close after shutdown");
        }
        outcome
    }

    async fn send_offer<S>(&self, ws_write: &mut S) -> Result<(), SignalingError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        self.adapter.add_recv_transceivers().await?;
        let offer = self.adapter.create_offer().await?;
        self.adapter.set_local_description(offer.clone()).await?;

        let offer = if self.options.trickle_ice {
            offer
        } else {
            self.adapter.wait_gathering_complete().await;
            self.adapter.local_description().await.unwrap_or(offer)
        };
        send_message(
            ws_write,
            &Action::SdpOffer,
            &SignalPayload::Description(offer),
        )
        .await?;
        tracing::info!(target: "kvs_agent::signaling", trickle = self.options.trickle_ice, "sent SDP_OFFER");
        Ok(())
    }

    async fn receive_loop<S, R>(
        &self,
        ws_write: &mut S,
        ws_read: &mut R,
        local_candidates: &mut Option<mpsc::UnboundedReceiver<IceCandidate>>,
        close_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), SignalingError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
        R: futures_util::Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let period = self.options.ping_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut negotiation = Negotiation::default();

        loop {
            tokio::select! {
                frame = ws_read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        tracing::trace!(target: "kvs_agent::signaling", kind = "text", len = text.len(), "ws_in");
                        self.handle_incoming(&mut negotiation, &text).await?;
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => self.handle_incoming(&mut negotiation, &text).await?,
                        Err(_) => {
                            tracing::warn!(target: "kvs_agent::signaling", "ignoring non-utf8 binary frame");
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(target: "kvs_agent::signaling", frame = ?frame, "signaling channel closed by remote");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) if is_peer_closed(&err) => {
                        tracing::debug!(target: "kvs_agent::signaling", "signaling websocket closed: {err}");
                        return Ok(());
                    }
                    Some(Err(err)) => return Err(SignalingError::Channel(err)),
                    None => return Ok(()),
                },
                candidate = next_local_candidate(local_candidates) => match candidate {
                    Some(candidate) => {
                        tracing::debug!(target: "kvs_agent::signaling", candidate = %candidate.candidate, "sending local candidate");
                        send_message(ws_write, &Action::IceCandidate, &SignalPayload::Candidate(candidate)).await?;
                    }
                    None => *local_candidates = None,
                },
                _ = ticker.tick() => match ws_write.send(Message::Ping(Vec::new())).await {
                    Ok(()) => {}
                    Err(err) if is_peer_closed(&err) => {
                        tracing::debug!(target: "kvs_agent::signaling", "keep-alive found websocket closed: {err}");
                        return Ok(());
                    }
                    Err(err) => return Err(SignalingError::Channel(err)),
                },
                _ = close_requested(close_rx) => {
                    tracing::info!(target: "kvs_agent::signaling", "local close requested");
                    return Ok(());
                }
            }
        }
    }

    /// Applies one inbound text frame. Only description failures are fatal.
    pub(crate) async fn handle_incoming(
        &self,
        negotiation: &mut Negotiation,
        text: &str,
    ) -> Result<(), SignalingError> {
        let state = self.state();
        if !matches!(state, SignalingState::Negotiating | SignalingState::Open) {
            tracing::debug!(target: "kvs_agent::signaling", state = ?state, "message outside negotiation ignored");
            return Ok(());
        }
        if text.trim().is_empty() {
            return Ok(());
        }
        let message = match codec::decode(text) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(target: "kvs_agent::signaling", error = %err, "skipping undecodable signaling message");
                return Ok(());
            }
        };
        tracing::debug!(
            target: "kvs_agent::signaling",
            action = %message.action,
            sender = ?message.sender_id,
            "signaling message received"
        );

        match (message.action, message.payload) {
            (Action::SdpAnswer, SignalPayload::Description(answer)) => {
                self.apply_answer(negotiation, answer).await
            }
            (Action::IceCandidate, SignalPayload::Candidate(candidate)) => {
                if negotiation.remote_description_set {
                    self.add_candidate(candidate).await;
                } else {
                    negotiation.pending_candidates.push_back(candidate);
                    tracing::debug!(
                        target: "kvs_agent::signaling",
                        queued = negotiation.pending_candidates.len(),
                        "candidate queued until answer"
                    );
                }
                Ok(())
            }
            (action, _) => {
                tracing::debug!(target: "kvs_agent::signaling", action = %action, "ignoring signaling message");
                Ok(())
            }
        }
    }

    async fn apply_answer(
        &self,
        negotiation: &mut Negotiation,
        answer: SessionDescription,
    ) -> Result<(), SignalingError> {
        if negotiation.remote_description_set {
            tracing::info!(target: "kvs_agent::signaling", "duplicate SDP_ANSWER ignored");
            return Ok(());
        }
        self.adapter.set_remote_description(answer).await?;
        negotiation.remote_description_set = true;
        self.set_state(SignalingState::Open);

        let queued = negotiation.pending_candidates.len();
        if queued > 0 {
            tracing::debug!(target: "kvs_agent::signaling", queued, "flushing queued candidates");
        }
        while let Some(candidate) = negotiation.pending_candidates.pop_front() {
            self.add_candidate(candidate).await;
        }
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) {
        if let Err(err) = self.adapter.add_ice_candidate(candidate).await {
            tracing::warn!(target: "kvs_agent::signaling", error = %err, "remote candidate rejected; skipping");
        }
    }
}

async fn send_message<S>(
    ws_write: &mut S,
    action: &Action,
    payload: &SignalPayload,
) -> Result<(), SignalingError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let text = codec::encode(action, payload, "")?;
    ws_write.send(Message::Text(text)).await?;
    Ok(())
}

async fn next_local_candidate(
    receiver: &mut Option<mpsc::UnboundedReceiver<IceCandidate>>,
) -> Option<IceCandidate> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn close_requested(close_rx: &mut watch::Receiver<bool>) {
    if close_rx.wait_for(|closed| *closed).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Errors that mean the other end went away rather than the transport failing.
fn is_peer_closed(err: &WsError) -> bool {
    match err {
        WsError::ConnectionClosed
        | WsError::AlreadyClosed
        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        WsError::Io(io) => matches!(
            io.kind(),
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
        ),
        _ => false,
    }
}
