#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::{
    Query, State,
    ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
};
use axum::response::IntoResponse;
use axum::routing::get;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};

use kvs_agent::auth::Credentials;
use kvs_agent::media::{
    Frame, FrameSink, MediaTrack, SinkError, SinkFactory, Timestamp, TrackError, TrackKind,
};
use kvs_agent::peer::{
    NegotiationError, PeerConnectionAdapter, PeerConnectionFactory, PeerEvent,
};
use kvs_agent::signaling::{
    ConnectionInfo, ConnectionInfoResolver, ConnectivityServer, IceCandidate, ResolveError,
    SessionDescription,
};

/// Ordered record of what the fakes saw, shared between adapter and sinks.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }
}

pub async fn wait_until<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn test_credentials() -> Credentials {
    Credentials::new("AKIDTEST", "secret-key", Some("session-token".into()))
}

// ---------------------------------------------------------------------------
// Peer adapter

pub struct FakeAdapter {
    log: EventLog,
    remote_set: AtomicBool,
    candidates: AtomicUsize,
    events: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
    local_tx: mpsc::UnboundedSender<IceCandidate>,
    local_rx: Mutex<Option<mpsc::UnboundedReceiver<IceCandidate>>>,
    servers: Mutex<Vec<ConnectivityServer>>,
    closed: AtomicBool,
}

impl FakeAdapter {
    pub fn new(log: EventLog) -> Arc<Self> {
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            log,
            remote_set: AtomicBool::new(false),
            candidates: AtomicUsize::new(0),
            events: Mutex::new(None),
            local_tx,
            local_rx: Mutex::new(Some(local_rx)),
            servers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.load(Ordering::SeqCst)
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_set.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn servers(&self) -> Vec<ConnectivityServer> {
        self.servers.lock().unwrap().clone()
    }

    pub fn emit(&self, event: PeerEvent) {
        let guard = self.events.lock().unwrap();
        let sender = guard.as_ref().expect("adapter not created by factory");
        sender.send(event).expect("session dropped peer events");
    }

    pub fn gather(&self, candidate: &str) {
        self.local_tx
            .send(IceCandidate {
                candidate: candidate.to_string(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            })
            .unwrap();
    }
}

#[async_trait]
impl PeerConnectionAdapter for FakeAdapter {
    async fn add_recv_transceivers(&self) -> Result<(), NegotiationError> {
        self.log.push("adapter:transceivers");
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.log.push("adapter:create_offer");
        Ok(SessionDescription::offer("v=0\r\no=fake-offer\r\n"))
    }

    async fn set_local_description(
        &self,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.log.push(format!("adapter:local:{}", offer.sdp.len()));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if answer.sdp.contains("reject") {
            return Err(NegotiationError::RemoteDescription("bad answer".into()));
        }
        self.log.push(format!("adapter:remote:{}", answer.sdp));
        self.remote_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        if !self.remote_set.load(Ordering::SeqCst) {
            self.log.push(format!("adapter:early:{}", candidate.candidate));
            return Err(NegotiationError::Candidate(
                "remote description not set".into(),
            ));
        }
        self.log.push(format!("adapter:candidate:{}", candidate.candidate));
        self.candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_gathering_complete(&self) {}

    async fn local_description(&self) -> Option<SessionDescription> {
        Some(SessionDescription::offer(
            "v=0\r\no=fake-offer\r\na=candidate:gathered\r\n",
        ))
    }

    fn take_local_candidates(&self) -> Option<mpsc::UnboundedReceiver<IceCandidate>> {
        self.local_rx.lock().unwrap().take()
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.log.push("adapter:close");
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakePeerFactory {
    pub adapter: Arc<FakeAdapter>,
    pub created: AtomicUsize,
}

impl FakePeerFactory {
    pub fn new(adapter: Arc<FakeAdapter>) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            created: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        servers: &[ConnectivityServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnectionAdapter>, NegotiationError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        *self.adapter.servers.lock().unwrap() = servers.to_vec();
        *self.adapter.events.lock().unwrap() = Some(events);
        Ok(self.adapter.clone())
    }
}

// ---------------------------------------------------------------------------
// Resolver

pub struct StaticResolver {
    info: ConnectionInfo,
    pub calls: AtomicUsize,
}

impl StaticResolver {
    pub fn new(wss_endpoint: &str) -> Arc<Self> {
        Arc::new(Self {
            info: ConnectionInfo {
                channel_arn: "arn:aws:kinesisvideo:us-west-2:123456789012:channel/test/1".into(),
                wss_endpoint: wss_endpoint.to_string(),
                https_endpoint: "https://r-test.kinesisvideo.us-west-2.amazonaws.com".into(),
                ice_servers: vec![ConnectivityServer::regional_stun("us-west-2")],
            },
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ConnectionInfoResolver for StaticResolver {
    async fn resolve(
        &self,
        _channel_name: &str,
        _client_id: &str,
        _credentials: &Credentials,
    ) -> Result<ConnectionInfo, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.info.clone())
    }
}

// ---------------------------------------------------------------------------
// Tracks and sinks

/// Yields the given frames, then either ends or stays open forever.
pub struct ScriptedTrack {
    kind: TrackKind,
    id: String,
    frames: VecDeque<Frame>,
    hold_open: bool,
}

impl ScriptedTrack {
    pub fn new(kind: TrackKind, id: &str, payloads: &[&'static [u8]]) -> Self {
        let frames = payloads
            .iter()
            .enumerate()
            .map(|(i, payload)| Frame {
                data: Bytes::from_static(payload),
                pts: Some(Duration::from_millis(33 * i as u64)),
            })
            .collect();
        Self {
            kind,
            id: id.to_string(),
            frames,
            hold_open: false,
        }
    }

    pub fn held_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn boxed(self) -> Box<dyn MediaTrack> {
        Box::new(self)
    }
}

#[async_trait]
impl MediaTrack for ScriptedTrack {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>, TrackError> {
        match self.frames.pop_front() {
            Some(frame) => Ok(Some(frame)),
            None if self.hold_open => std::future::pending().await,
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkBehavior {
    Accept,
    Reject,
    Stall,
}

#[derive(Clone)]
pub struct RecordingSinks {
    log: EventLog,
    behavior: Arc<HashMap<TrackKind, SinkBehavior>>,
    pushes: Arc<Mutex<Vec<(TrackKind, Bytes, Timestamp)>>>,
    failed_creation: Arc<HashSet<TrackKind>>,
}

impl RecordingSinks {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            behavior: Arc::new(HashMap::new()),
            pushes: Arc::new(Mutex::new(Vec::new())),
            failed_creation: Arc::new(HashSet::new()),
        }
    }

    pub fn with_behavior(mut self, kind: TrackKind, behavior: SinkBehavior) -> Self {
        Arc::make_mut(&mut self.behavior).insert(kind, behavior);
        self
    }

    pub fn failing_creation(mut self, kind: TrackKind) -> Self {
        Arc::make_mut(&mut self.failed_creation).insert(kind);
        self
    }

    pub fn pushes(&self) -> Vec<(TrackKind, Bytes, Timestamp)> {
        self.pushes.lock().unwrap().clone()
    }

    pub fn pushes_for(&self, kind: TrackKind) -> Vec<Bytes> {
        self.pushes()
            .into_iter()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, data, _)| data)
            .collect()
    }
}

struct RecordingSink {
    kind: TrackKind,
    behavior: SinkBehavior,
    log: EventLog,
    pushes: Arc<Mutex<Vec<(TrackKind, Bytes, Timestamp)>>>,
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn push(&mut self, data: Bytes, timestamp: Timestamp) -> Result<(), SinkError> {
        self.pushes.lock().unwrap().push((self.kind, data, timestamp));
        match self.behavior {
            SinkBehavior::Accept => Ok(()),
            SinkBehavior::Reject => Err(SinkError::Rejected {
                kind: self.kind,
                reason: "pipeline refused buffer".into(),
            }),
            SinkBehavior::Stall => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.log.push(format!("sink:close:{}", self.kind));
    }
}

#[async_trait]
impl SinkFactory for RecordingSinks {
    async fn create_sink(&self, kind: TrackKind) -> Result<Box<dyn FrameSink>, SinkError> {
        if self.failed_creation.contains(&kind) {
            return Err(SinkError::Create {
                kind,
                reason: "pipeline missing".into(),
            });
        }
        self.log.push(format!("sink:create:{kind}"));
        Ok(Box::new(RecordingSink {
            kind,
            behavior: self.behavior.get(&kind).copied().unwrap_or(SinkBehavior::Accept),
            log: self.log.clone(),
            pushes: Arc::clone(&self.pushes),
        }))
    }
}

// ---------------------------------------------------------------------------
// Signaling channel

pub enum ChannelCommand {
    Text(String),
    Close,
}

#[derive(Clone)]
struct ChannelState {
    inbound: mpsc::UnboundedSender<String>,
    commands: Arc<AsyncMutex<Option<mpsc::UnboundedReceiver<ChannelCommand>>>>,
    query: Arc<Mutex<Option<HashMap<String, String>>>>,
    connections: Arc<AtomicUsize>,
    pings: Arc<AtomicUsize>,
}

/// A local websocket endpoint standing in for the signaling service.
pub struct FakeChannel {
    pub addr: SocketAddr,
    pub inbound: mpsc::UnboundedReceiver<String>,
    commands: mpsc::UnboundedSender<ChannelCommand>,
    query: Arc<Mutex<Option<HashMap<String, String>>>>,
    connections: Arc<AtomicUsize>,
    pings: Arc<AtomicUsize>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl FakeChannel {
    pub async fn spawn() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let state = ChannelState {
            inbound: inbound_tx,
            commands: Arc::new(AsyncMutex::new(Some(command_rx))),
            query: Arc::new(Mutex::new(None)),
            connections: Arc::new(AtomicUsize::new(0)),
            pings: Arc::new(AtomicUsize::new(0)),
        };
        let query = Arc::clone(&state.query);
        let connections = Arc::clone(&state.connections);
        let pings = Arc::clone(&state.pings);

        let router = Router::new()
            .route("/", get(ws_handler))
            .with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener bind");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            addr,
            inbound: inbound_rx,
            commands: command_tx,
            query,
            connections,
            pings,
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    pub fn send(&self, text: String) {
        let _ = self.commands.send(ChannelCommand::Text(text));
    }

    pub fn close(&self) {
        let _ = self.commands.send(ChannelCommand::Close);
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Keep-alive pings received across all connections.
    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn query(&self) -> Option<HashMap<String, String>> {
        self.query.lock().unwrap().clone()
    }

    /// Next decoded message the client sent, skipping nothing.
    pub async fn recv_json(&mut self) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(5), self.inbound.recv())
            .await
            .expect("timed out waiting for client message")
            .expect("channel closed");
        serde_json::from_str(&text).expect("client sent json")
    }
}

impl Drop for FakeChannel {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<ChannelState>,
) -> impl IntoResponse {
    state.connections.fetch_add(1, Ordering::SeqCst);
    *state.query.lock().unwrap() = Some(query);
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ChannelState) {
    let Some(mut commands) = state.commands.lock().await.take() else {
        return;
    };
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = state.inbound.send(text);
                }
                Some(Ok(WsMessage::Ping(_))) => {
                    state.pings.fetch_add(1, Ordering::SeqCst);
                }
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            command = commands.recv() => match command {
                Some(ChannelCommand::Text(text)) => {
                    if sender.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(ChannelCommand::Close) | None => {
                    let _ = sender.send(WsMessage::Close(None)).await;
                    break;
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Wire helpers

pub fn inbound_frame(action: &str, payload: Value) -> String {
    json!({
        "messageType": action,
        "messagePayload": BASE64_STANDARD.encode(payload.to_string()),
        "senderClientId": "",
    })
    .to_string()
}

pub fn answer_frame(sdp: &str) -> String {
    inbound_frame("SDP_ANSWER", json!({"type": "answer", "sdp": sdp}))
}

pub fn candidate_frame(candidate: &str, mline_index: u16) -> String {
    inbound_frame(
        "ICE_CANDIDATE",
        json!({
            "candidate": candidate,
            "sdpMid": mline_index.to_string(),
            "sdpMLineIndex": mline_index,
        }),
    )
}

pub fn decode_payload(message: &Value) -> Value {
    let encoded = message["messagePayload"]
        .as_str()
        .expect("messagePayload string");
    let bytes = BASE64_STANDARD.decode(encoded).expect("base64 payload");
    serde_json::from_slice(&bytes).expect("json payload")
}
