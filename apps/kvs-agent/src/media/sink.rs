use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use super::{Timestamp, TrackKind};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to create {kind} sink: {reason}")]
    Create { kind: TrackKind, reason: String },
    #[error("{kind} sink rejected frame: {reason}")]
    Rejected { kind: TrackKind, reason: String },
    #[error("{kind} sink stalled: push did not complete within {timeout:?}")]
    Stalled { kind: TrackKind, timeout: Duration },
    #[error("{kind} sink is closed")]
    Closed { kind: TrackKind },
}

/// Downstream consumer of raw frames for one track kind.
#[async_trait]
pub trait FrameSink: Send {
    async fn push(&mut self, data: Bytes, timestamp: Timestamp) -> Result<(), SinkError>;
    async fn close(&mut self);
}

#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn create_sink(&self, kind: TrackKind) -> Result<Box<dyn FrameSink>, SinkError>;
}

/// Shared handle around one created sink. Closing is idempotent.
pub struct RelaySink {
    kind: TrackKind,
    inner: Mutex<Option<Box<dyn FrameSink>>>,
}

impl RelaySink {
    fn new(kind: TrackKind, sink: Box<dyn FrameSink>) -> Self {
        Self {
            kind,
            inner: Mutex::new(Some(sink)),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub async fn push(&self, data: Bytes, timestamp: Timestamp) -> Result<(), SinkError> {
        let mut guard = self.inner.lock().await;
        match guard.as_mut() {
            Some(sink) => sink.push(data, timestamp).await,
            None => Err(SinkError::Closed { kind: self.kind }),
        }
    }

    /// Returns `false` when the sink had already been closed.
    pub async fn close(&self) -> bool {
        let taken = self.inner.lock().await.take();
        match taken {
            Some(mut sink) => {
                sink.close().await;
                tracing::info!(target: "kvs_agent::relay", kind = %self.kind, "sink closed");
                true
            }
            None => false,
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}

/// Creates at most one sink per kind, on demand.
pub struct SinkRegistry {
    factory: Arc<dyn SinkFactory>,
    sinks: Mutex<HashMap<TrackKind, Arc<RelaySink>>>,
}

impl SinkRegistry {
    pub fn new(factory: Arc<dyn SinkFactory>) -> Self {
        Self {
            factory,
            sinks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, kind: TrackKind) -> Result<Arc<RelaySink>, SinkError> {
        let mut sinks = self.sinks.lock().await;
        if let Some(existing) = sinks.get(&kind) {
            return Ok(Arc::clone(existing));
        }
        let sink = Arc::new(RelaySink::new(kind, self.factory.create_sink(kind).await?));
        sinks.insert(kind, Arc::clone(&sink));
        tracing::info!(target: "kvs_agent::relay", kind = %kind, "sink created");
        Ok(sink)
    }

    pub async fn release(&self, kind: TrackKind) {
        let removed = self.sinks.lock().await.remove(&kind);
        if let Some(sink) = removed {
            sink.close().await;
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<Arc<RelaySink>> = {
            let mut sinks = self.sinks.lock().await;
            let mut kinds: Vec<TrackKind> = sinks.keys().copied().collect();
            kinds.sort();
            kinds.into_iter().filter_map(|kind| sinks.remove(&kind)).collect()
        };
        for sink in drained {
            sink.close().await;
        }
    }

    pub async fn active_kinds(&self) -> Vec<TrackKind> {
        let mut kinds: Vec<TrackKind> = self.sinks.lock().await.keys().copied().collect();
        kinds.sort();
        kinds
    }
}
