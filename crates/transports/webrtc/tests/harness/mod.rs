//! Negotiation test harness
//!
//! Builds sessions over the in-memory engine and records what crosses the
//! signaling relay.
//!
//! Basic usage pattern:
//!
//! 1. Call `init_tracing()` for opt-in log output (`RUST_LOG`)
//! 2. Build a session with `MemorySession::start()` or `start_recorded()`
//! 3. Drive it and inspect the handles and recorded envelopes
//! 4. Hang up

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use peerlink_webrtc::peer::MemoryPeerConnection;
use peerlink_webrtc::{
    Diagnostic, Diagnostics, EndpointId, Envelope, HandlePair, InProcessRelay, MediaStream,
    MemoryPeerConfig, NegotiationConfig, NegotiationSession, SignalingMessage, SignalingRelay,
    TrackKind,
};
use tokio::sync::broadcast;

/// Upper bound for any single wait in a scenario
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Await `future`, failing the test if it takes longer than `STEP_TIMEOUT`
pub async fn within<F: Future>(what: &str, future: F) -> F::Output {
    match tokio::time::timeout(STEP_TIMEOUT, future).await {
        Ok(output) => output,
        Err(_) => panic!("Timeout: {}", what),
    }
}

/// Poll `condition` until it holds
pub async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    within(what, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

pub fn local_video() -> MediaStream {
    MediaStream::new("local-stream").with_track(TrackKind::Video, "Test Camera")
}

/// Relay that records every envelope after a JSON round trip
pub struct RecordingRelay {
    inner: InProcessRelay,
    recorded: Mutex<Vec<Envelope>>,
}

impl RecordingRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InProcessRelay::new(),
            recorded: Mutex::new(Vec::new()),
        })
    }

    pub fn recorded(&self) -> Vec<Envelope> {
        self.recorded.lock().clone()
    }

    /// Candidates sent by `from`, in relay order
    pub fn candidates_from(&self, from: EndpointId) -> Vec<(u64, String)> {
        self.recorded()
            .into_iter()
            .filter(|e| e.from == from)
            .filter_map(|e| match e.message {
                SignalingMessage::Candidate {
                    sequence,
                    candidate,
                } => Some((sequence, candidate.candidate)),
                _ => None,
            })
            .collect()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.recorded.lock().iter().map(|e| e.message.kind()).collect()
    }
}

#[async_trait]
impl SignalingRelay for RecordingRelay {
    async fn deliver(&self, envelope: Envelope) -> peerlink_webrtc::Result<()> {
        let json = envelope.to_json()?;
        let decoded = Envelope::from_json(&json)?;
        self.recorded.lock().push(decoded.clone());
        self.inner.deliver(decoded).await
    }
}

/// A session over two in-memory handles
pub struct MemorySession {
    pub session: NegotiationSession,
    pub local: Arc<MemoryPeerConnection>,
    pub remote: Arc<MemoryPeerConnection>,
    pub relay: Option<Arc<RecordingRelay>>,
    pub diagnostics: broadcast::Receiver<Diagnostic>,
}

impl MemorySession {
    pub async fn start(
        config: NegotiationConfig,
        local: MemoryPeerConfig,
        remote: MemoryPeerConfig,
    ) -> Self {
        Self::build(config, local, remote, None).await
    }

    pub async fn start_recorded(
        config: NegotiationConfig,
        local: MemoryPeerConfig,
        remote: MemoryPeerConfig,
    ) -> Self {
        Self::build(config, local, remote, Some(RecordingRelay::new())).await
    }

    async fn build(
        config: NegotiationConfig,
        local_cfg: MemoryPeerConfig,
        remote_cfg: MemoryPeerConfig,
        relay: Option<Arc<RecordingRelay>>,
    ) -> Self {
        init_tracing();

        let (local, remote) = MemoryPeerConnection::pair(local_cfg, remote_cfg);
        let handles = HandlePair {
            local: local.clone(),
            remote: remote.clone(),
        };
        let stream = match config.data_path {
            peerlink_webrtc::DataPathKind::MediaStream => Some(local_video()),
            peerlink_webrtc::DataPathKind::DataChannel => None,
        };

        let diagnostics = Diagnostics::new();
        let diagnostics_rx = diagnostics.subscribe();

        let session = match &relay {
            Some(relay) => {
                let inbound = stream::select(
                    relay.inner.take_inbox(EndpointId::Local).unwrap(),
                    relay.inner.take_inbox(EndpointId::Remote).unwrap(),
                )
                .boxed();
                NegotiationSession::start_with_relay(
                    &config,
                    handles,
                    stream,
                    diagnostics,
                    relay.clone(),
                    inbound,
                )
                .await
            }
            None => NegotiationSession::start(&config, handles, stream, diagnostics).await,
        }
        .expect("session should start");

        Self {
            session,
            local,
            remote,
            relay,
            diagnostics: diagnostics_rx,
        }
    }

    pub fn relay(&self) -> &RecordingRelay {
        self.relay.as_deref().expect("session was started without recording")
    }

    /// Diagnostics emitted so far
    pub fn drain_diagnostics(&mut self) -> Vec<Diagnostic> {
        let mut drained = Vec::new();
        while let Ok(diagnostic) = self.diagnostics.try_recv() {
            drained.push(diagnostic);
        }
        drained
    }
}
