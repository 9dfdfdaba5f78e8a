//! Loopback call control surface
//!
//! Maps the start / call / send / hang-up controls onto one negotiation
//! session at a time and tracks which controls are enabled.

use crate::config::{DataPathKind, NegotiationConfig};
use crate::diagnostics::Diagnostics;
use crate::media::{MediaCapture, MediaStream};
use crate::peer::PeerConnectionFactory;
use crate::session::NegotiationSession;
use crate::{DataChannelState, Error, Result};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Enablement of the call controls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlState {
    pub start: bool,
    pub call: bool,
    pub hang_up: bool,
    pub send: bool,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            start: true,
            call: false,
            hang_up: false,
            send: false,
        }
    }
}

type ReceiveObserver = Arc<dyn Fn(Bytes) + Send + Sync>;

pub struct LoopbackCall {
    config: NegotiationConfig,
    factory: Arc<dyn PeerConnectionFactory>,
    capture: Arc<dyn MediaCapture>,
    diagnostics: Diagnostics,
    local_stream: Option<MediaStream>,
    session: Option<NegotiationSession>,
    controls: ControlState,
    observer: Option<ReceiveObserver>,
}

impl LoopbackCall {
    pub fn new(
        config: NegotiationConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        capture: Arc<dyn MediaCapture>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            factory,
            capture,
            diagnostics: Diagnostics::new(),
            local_stream: None,
            session: None,
            controls: ControlState::default(),
            observer: None,
        })
    }

    /// Current control enablement
    ///
    /// `send` follows the local half of the data path.
    pub fn controls(&self) -> ControlState {
        let send = self
            .session
            .as_ref()
            .map(|s| s.data_path().send_state() == DataChannelState::Open)
            .unwrap_or(false);
        ControlState {
            send,
            ..self.controls
        }
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn session(&self) -> Option<&NegotiationSession> {
        self.session.as_ref()
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local_stream.as_ref()
    }

    /// Observer for payloads arriving on the receive half
    ///
    /// Applies to the current session and every later one.
    pub fn on_receive<F>(&mut self, observer: F)
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        let observer: ReceiveObserver = Arc::new(observer);
        if let Some(session) = &self.session {
            let forward = Arc::clone(&observer);
            session.data_path().on_receive(move |payload| forward(payload));
        }
        self.observer = Some(observer);
    }

    /// Acquire local media for the media stream path
    pub async fn start(&mut self) -> Result<()> {
        if !self.controls.start {
            return Err(Error::InvalidState("start is disabled".to_string()));
        }
        self.controls.start = false;
        self.diagnostics.info(None, "Requesting local stream.");

        if self.config.data_path == DataPathKind::MediaStream {
            match self.capture.acquire(&self.config.media_constraints).await {
                Ok(stream) => {
                    self.diagnostics.info(None, "Received local stream.");
                    self.local_stream = Some(stream);
                }
                Err(e) => {
                    self.controls.start = true;
                    self.diagnostics
                        .error(None, format!("getUserMedia() error: {}", e));
                    return Err(e);
                }
            }
        }

        self.controls.call = true;
        Ok(())
    }

    /// Create both handles and begin negotiation
    pub async fn call(&mut self) -> Result<()> {
        if !self.controls.call {
            return Err(Error::InvalidState("call is disabled".to_string()));
        }
        self.diagnostics.info(None, "Starting call.");

        if let Some(stream) = &self.local_stream {
            for track in &stream.tracks {
                self.diagnostics
                    .info(None, format!("Using {} device: {}.", track.kind, track.label));
            }
        }

        let handles = self.factory.create_pair(&self.config).await?;
        self.diagnostics
            .info(None, "Created local and remote peer connection objects.");

        let session = NegotiationSession::start(
            &self.config,
            handles,
            self.local_stream.clone(),
            self.diagnostics.clone(),
        )
        .await?;

        if let Some(observer) = &self.observer {
            let forward = Arc::clone(observer);
            session.data_path().on_receive(move |payload| forward(payload));
        }

        if let Err(e) = session.create_offer().await {
            session.hang_up().await;
            return Err(e);
        }

        info!(session_id = %session.id(), "Call started");
        self.session = Some(session);
        self.controls.call = false;
        self.controls.hang_up = true;
        Ok(())
    }

    /// Send a payload over the data path
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| Error::NotReady("no call in progress".to_string()))?;

        let payload = payload.into();
        debug!(session_id = %session.id(), bytes = payload.len(), "Sending payload");
        session.data_path().send(payload).await
    }

    /// End the call; a no-op without one
    pub async fn hang_up(&mut self) {
        let Some(session) = self.session.take() else {
            debug!("Hang-up without a call");
            return;
        };

        session.data_path().close().await;
        session.hang_up().await;
        if let Some(failure) = session.snapshot().failure {
            warn!(session_id = %session.id(), "Call ended after failure: {}", failure);
        }

        info!(session_id = %session.id(), "Call ended");
        self.controls.hang_up = false;
        self.controls.send = false;
        self.controls.call = true;
    }
}
