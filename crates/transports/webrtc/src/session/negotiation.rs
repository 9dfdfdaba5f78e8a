//! Negotiation session driver
//!
//! One task per session owns both endpoints and serializes every state
//! transition. Handle operations run as in-flight futures and report back
//! as completions; each handle sees its operations in issuance order. ICE
//! candidates are relayed as soon as they are discovered, independently of
//! the offer/answer progress.

use super::state::{NegotiationMachine, NegotiationState};
use crate::config::{DataPathKind, NegotiationConfig, OfferOptions};
use crate::data_path::DataPathController;
use crate::description::{DescriptionTarget, IceCandidate, SessionDescription};
use crate::diagnostics::Diagnostics;
use crate::endpoint::{Endpoint, EndpointId};
use crate::media::MediaStream;
use crate::peer::{HandlePair, IceConnectionState, PeerConnectionHandle, PeerEvent};
use crate::signaling::{Envelope, InProcessRelay, SignalingMessage, SignalingRelay};
use crate::{Error, Result};
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Unique identifier of a negotiation session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Observable state of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: NegotiationState,
    /// Error that moved the session to `Failed`
    pub failure: Option<Error>,
    pub local_ice: IceConnectionState,
    pub remote_ice: IceConnectionState,
}

impl SessionSnapshot {
    fn initial() -> Self {
        Self {
            state: NegotiationState::Idle,
            failure: None,
            local_ice: IceConnectionState::New,
            remote_ice: IceConnectionState::New,
        }
    }
}

enum Command {
    CreateOffer { reply: oneshot::Sender<Result<()>> },
    HangUp { reply: oneshot::Sender<()> },
}

enum Completion {
    OfferCreated(Result<SessionDescription>),
    AnswerCreated(Result<SessionDescription>),
    DescriptionSet {
        endpoint: EndpointId,
        target: DescriptionTarget,
        result: Result<()>,
    },
    CandidateApplied {
        endpoint: EndpointId,
        sequence: u64,
        result: Result<()>,
    },
}

/// Handle to a running negotiation session
///
/// Dropping the last handle hangs the session up.
pub struct NegotiationSession {
    id: SessionId,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    data_path: DataPathController,
    diagnostics: Diagnostics,
}

impl fmt::Debug for NegotiationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiationSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl NegotiationSession {
    /// Start a session over an in-process relay
    ///
    /// Prepares the data path (send channel on the local handle, or the
    /// local stream for the media variant) and spawns the session task. The
    /// session stays `Idle` until [`create_offer`](Self::create_offer).
    pub async fn start(
        config: &NegotiationConfig,
        handles: HandlePair,
        local_stream: Option<MediaStream>,
        diagnostics: Diagnostics,
    ) -> Result<Self> {
        let relay = Arc::new(InProcessRelay::new());
        let inbound = match (
            relay.take_inbox(EndpointId::Local),
            relay.take_inbox(EndpointId::Remote),
        ) {
            (Some(local), Some(remote)) => stream::select(local, remote).boxed(),
            _ => {
                close_handles(&handles).await;
                return Err(Error::SignalingError("relay inboxes unavailable".to_string()));
            }
        };

        Self::start_with_relay(config, handles, local_stream, diagnostics, relay, inbound).await
    }

    /// Start a session over a caller-provided relay
    ///
    /// `inbound` must yield every envelope the relay delivers, for both
    /// endpoints.
    pub async fn start_with_relay(
        config: &NegotiationConfig,
        handles: HandlePair,
        local_stream: Option<MediaStream>,
        diagnostics: Diagnostics,
        relay: Arc<dyn SignalingRelay>,
        inbound: BoxStream<'static, Envelope>,
    ) -> Result<Self> {
        let prepared = prepare(config, &handles, local_stream, &diagnostics).await;
        let (events, data_path) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                close_handles(&handles).await;
                return Err(e);
            }
        };

        let id = SessionId::new();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::initial());

        let driver = Driver {
            id,
            offer_options: config.offer_options,
            machine: NegotiationMachine::new(),
            local: Endpoint::new(EndpointId::Local, handles.local),
            remote: Endpoint::new(EndpointId::Remote, handles.remote),
            relay,
            data_path: data_path.clone(),
            diagnostics: diagnostics.clone(),
            snapshot: snapshot_tx,
            failure: None,
            inflight: FuturesUnordered::new(),
        };

        info!(session_id = %id, data_path = ?config.data_path, "Negotiation session created");
        tokio::spawn(driver.run(commands_rx, events, inbound));

        Ok(Self {
            id,
            commands: commands_tx,
            snapshot: snapshot_rx,
            data_path,
            diagnostics,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Ask the local endpoint to create the offer
    ///
    /// Returns once the request is accepted; negotiation proceeds in the
    /// background. Fails with `InvalidState` unless the session is `Idle`
    /// with no offer in flight.
    pub async fn create_offer(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::CreateOffer { reply })
            .map_err(|_| Error::InvalidState("session is closed".to_string()))?;
        rx.await
            .map_err(|_| Error::InvalidState("session is closed".to_string()))?
    }

    /// Create the offer and wait until negotiation settles
    pub async fn negotiate(&self) -> Result<SessionSnapshot> {
        self.create_offer().await?;
        let snapshot = self.settled().await;
        match &snapshot.failure {
            Some(failure) => Err(failure.clone()),
            None => Ok(snapshot),
        }
    }

    /// Close both handles and the data path
    ///
    /// Safe from any state; a no-op once the session is closed.
    pub async fn hang_up(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::HangUp { reply }).is_err() {
            debug!(session_id = %self.id, "Hang-up on closed session");
            return;
        }
        let _ = rx.await;
    }

    /// Current state; a pure read
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> NegotiationState {
        self.snapshot.borrow().state
    }

    /// Wait until the session reaches or passes `state`
    ///
    /// Fails with the session's failure, or `InvalidState`, if it settles
    /// without getting there.
    pub async fn wait_for(&self, state: NegotiationState) -> Result<SessionSnapshot> {
        let snapshot = self
            .wait_until(|s| s.state == state || passed(s.state, state) || s.state.is_settled())
            .await;

        if snapshot.state == state || passed(snapshot.state, state) {
            return Ok(snapshot);
        }

        Err(snapshot.failure.clone().unwrap_or_else(|| {
            Error::InvalidState(format!(
                "session is {} while waiting for {}",
                snapshot.state, state
            ))
        }))
    }

    /// Wait until the session is `Negotiated`, `Failed` or `Closed`
    pub async fn settled(&self) -> SessionSnapshot {
        self.wait_until(|s| s.state.is_settled()).await
    }

    pub fn data_path(&self) -> &DataPathController {
        &self.data_path
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    async fn wait_until<F>(&self, predicate: F) -> SessionSnapshot
    where
        F: Fn(&SessionSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let result = rx.wait_for(|s| predicate(s)).await.map(|s| s.clone());
        match result {
            Ok(snapshot) => snapshot,
            // Session task is gone; its last snapshot is final
            Err(_) => rx.borrow().clone(),
        }
    }
}

/// Position along the offer/answer progression
fn progress(state: NegotiationState) -> Option<u8> {
    match state {
        NegotiationState::Idle => Some(0),
        NegotiationState::OfferCreated => Some(1),
        NegotiationState::OfferApplied => Some(2),
        NegotiationState::AnswerCreated => Some(3),
        NegotiationState::Negotiated => Some(4),
        NegotiationState::Failed | NegotiationState::Closed => None,
    }
}

fn passed(current: NegotiationState, target: NegotiationState) -> bool {
    match (progress(current), progress(target)) {
        (Some(current), Some(target)) => current > target,
        _ => false,
    }
}

type PeerEvents = BoxStream<'static, (EndpointId, PeerEvent)>;

async fn prepare(
    config: &NegotiationConfig,
    handles: &HandlePair,
    local_stream: Option<MediaStream>,
    diagnostics: &Diagnostics,
) -> Result<(PeerEvents, DataPathController)> {
    config.validate()?;

    let taken = |endpoint: EndpointId| {
        Error::PeerConnectionError(format!("event stream of {} already taken", endpoint))
    };
    let local_events = handles
        .local
        .take_events()
        .ok_or_else(|| taken(EndpointId::Local))?;
    let remote_events = handles
        .remote
        .take_events()
        .ok_or_else(|| taken(EndpointId::Remote))?;

    let data_path = DataPathController::new(
        config.data_path,
        config.max_message_size,
        diagnostics.clone(),
    );

    match config.data_path {
        DataPathKind::DataChannel => {
            let channel = handles
                .local
                .create_data_channel(&config.channel_label, config.channel_mode)
                .await?;
            diagnostics.info(
                Some(EndpointId::Local),
                format!("Created send data channel '{}'", config.channel_label),
            );
            data_path.attach_send(channel);
        }
        DataPathKind::MediaStream => {
            let stream = local_stream.ok_or_else(|| {
                Error::InvalidState("media stream path requires local media".to_string())
            })?;
            handles.local.add_stream(&stream).await?;
            diagnostics.info(Some(EndpointId::Local), "Added local stream.");
            data_path.attach_local_stream(stream);
        }
    }

    let events = stream::select_all([
        local_events.map(|e| (EndpointId::Local, e)).boxed(),
        remote_events.map(|e| (EndpointId::Remote, e)).boxed(),
    ])
    .boxed();

    Ok((events, data_path))
}

async fn close_handles(handles: &HandlePair) {
    for (endpoint, handle) in [
        (EndpointId::Local, &handles.local),
        (EndpointId::Remote, &handles.remote),
    ] {
        if let Err(e) = handle.close().await {
            warn!(%endpoint, "Failed to close peer connection: {}", e);
        }
    }
}

struct Driver {
    id: SessionId,
    offer_options: OfferOptions,
    machine: NegotiationMachine,
    local: Endpoint,
    remote: Endpoint,
    relay: Arc<dyn SignalingRelay>,
    data_path: DataPathController,
    diagnostics: Diagnostics,
    snapshot: watch::Sender<SessionSnapshot>,
    failure: Option<Error>,
    inflight: FuturesUnordered<BoxFuture<'static, Completion>>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: PeerEvents,
        mut inbound: BoxStream<'static, Envelope>,
    ) {
        debug!(session_id = %self.id, "Session loop started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::CreateOffer { reply }) => {
                        let _ = reply.send(self.create_offer());
                    }
                    Some(Command::HangUp { reply }) => {
                        self.hang_up().await;
                        let _ = reply.send(());
                        break;
                    }
                    // Every session handle is gone
                    None => {
                        self.hang_up().await;
                        break;
                    }
                },

                Some((endpoint, event)) = events.next() => {
                    self.on_peer_event(endpoint, event).await;
                }

                Some(envelope) = inbound.next() => {
                    self.on_envelope(envelope);
                }

                Some(completion) = self.inflight.next(), if !self.inflight.is_empty() => {
                    self.on_completion(completion).await;
                }
            }
        }

        info!(session_id = %self.id, "Session loop stopped");
    }

    fn endpoint(&self, id: EndpointId) -> &Endpoint {
        match id {
            EndpointId::Local => &self.local,
            EndpointId::Remote => &self.remote,
        }
    }

    fn endpoint_mut(&mut self, id: EndpointId) -> &mut Endpoint {
        match id {
            EndpointId::Local => &mut self.local,
            EndpointId::Remote => &mut self.remote,
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(SessionSnapshot {
            state: self.machine.state(),
            failure: self.failure.clone(),
            local_ice: self.local.ice_state(),
            remote_ice: self.remote.ice_state(),
        });
    }

    /// Queue an operation against one endpoint's handle
    ///
    /// Operations on the same handle run in issuance order; operations on
    /// different handles run concurrently.
    fn issue<F, Fut>(&mut self, endpoint: EndpointId, op: F)
    where
        F: FnOnce(Arc<dyn PeerConnectionHandle>) -> Fut,
        Fut: Future<Output = Completion> + Send + 'static,
    {
        let endpoint = self.endpoint(endpoint);
        let turns = endpoint.turns();
        let operation = op(Arc::clone(endpoint.handle()));
        self.inflight.push(
            async move {
                let _turn = turns.lock_owned().await;
                operation.await
            }
            .boxed(),
        );
    }

    #[instrument(skip(self), fields(session_id = %self.id))]
    fn create_offer(&mut self) -> Result<()> {
        self.machine.begin_offer()?;

        self.diagnostics
            .info(Some(EndpointId::Local), "createOffer start.");
        let options = self.offer_options;
        self.issue(EndpointId::Local, move |handle| async move {
            Completion::OfferCreated(handle.create_offer(&options).await)
        });
        Ok(())
    }

    fn create_answer(&mut self) {
        self.diagnostics
            .info(Some(EndpointId::Remote), "createAnswer start.");
        self.issue(EndpointId::Remote, |handle| async move {
            Completion::AnswerCreated(handle.create_answer().await)
        });
    }

    fn set_description(
        &mut self,
        endpoint: EndpointId,
        target: DescriptionTarget,
        description: SessionDescription,
    ) {
        debug!(
            session_id = %self.id,
            %endpoint,
            %target,
            sdp_type = %description.sdp_type(),
            "Setting description"
        );
        self.issue(endpoint, move |handle| async move {
            let result = match target {
                DescriptionTarget::Local => handle.set_local_description(description).await,
                DescriptionTarget::Remote => handle.set_remote_description(description).await,
            };
            Completion::DescriptionSet {
                endpoint,
                target,
                result,
            }
        });
    }

    fn apply_candidate(&mut self, endpoint: EndpointId, sequence: u64, candidate: IceCandidate) {
        self.issue(endpoint, move |handle| async move {
            let result = handle.add_ice_candidate(candidate).await;
            Completion::CandidateApplied {
                endpoint,
                sequence,
                result,
            }
        });
    }

    /// Hand a message to the relay
    ///
    /// The returned future owns everything it needs, so the driver is not
    /// borrowed across the delivery.
    fn relay(
        &self,
        from: EndpointId,
        message: SignalingMessage,
    ) -> impl Future<Output = ()> + Send + 'static {
        let relay = Arc::clone(&self.relay);
        let session_id = self.id;
        async move {
            let kind = message.kind();
            if let Err(e) = relay.deliver(Envelope::to_counterpart(from, message)).await {
                warn!(%session_id, %from, kind, "Failed to relay message: {}", e);
            }
        }
    }

    async fn on_peer_event(&mut self, endpoint: EndpointId, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(None) => {
                debug!(session_id = %self.id, %endpoint, "End of candidates");
            }
            PeerEvent::IceCandidate(Some(candidate)) if candidate.is_end_of_candidates() => {
                debug!(session_id = %self.id, %endpoint, "Empty candidate dropped");
            }
            PeerEvent::IceCandidate(Some(candidate)) => {
                let sequence = self.endpoint_mut(endpoint).next_candidate_sequence();
                debug!(session_id = %self.id, %endpoint, sequence, "Relaying ICE candidate");
                self.diagnostics.info(
                    Some(endpoint),
                    format!("ICE candidate:\n{}.", candidate.candidate),
                );
                self.relay(endpoint, SignalingMessage::candidate(sequence, candidate))
                    .await;
            }
            PeerEvent::IceConnectionStateChange(state) => {
                self.endpoint_mut(endpoint).set_ice_state(state);
                self.diagnostics
                    .info(Some(endpoint), format!("ICE state: {}.", state));
                self.publish();
            }
            PeerEvent::RemoteStream(stream) => {
                self.diagnostics
                    .info(Some(endpoint), "received remote stream.");
                self.data_path.attach_remote_stream(stream);
            }
            PeerEvent::DataChannel(channel) => {
                self.diagnostics.info(
                    Some(endpoint),
                    format!("Receive channel '{}' created.", channel.label()),
                );
                self.data_path.attach_receive(channel);
            }
        }
    }

    fn on_envelope(&mut self, envelope: Envelope) {
        let Envelope { from, to, message } = envelope;
        match message {
            SignalingMessage::Candidate {
                sequence,
                candidate,
            } => {
                debug!(session_id = %self.id, %from, %to, sequence, "Applying relayed candidate");
                self.apply_candidate(to, sequence, candidate);
            }
            SignalingMessage::Offer { description } | SignalingMessage::Answer { description } => {
                if self.machine.state() == NegotiationState::Failed {
                    debug!(session_id = %self.id, %to, "Session failed; dropping description");
                    return;
                }
                let expected_recipient = match description.sdp_type() {
                    crate::description::SdpType::Offer => EndpointId::Remote,
                    crate::description::SdpType::Answer => EndpointId::Local,
                };
                if to != expected_recipient {
                    warn!(
                        session_id = %self.id,
                        %to,
                        sdp_type = %description.sdp_type(),
                        "Description delivered to the wrong endpoint"
                    );
                    return;
                }
                self.set_description(to, DescriptionTarget::Remote, description);
            }
        }
    }

    async fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::OfferCreated(Ok(offer)) => {
                if let Err(e) = self.machine.offer_created(&offer) {
                    debug!(session_id = %self.id, "Dropping offer: {}", e);
                    return;
                }
                self.diagnostics.info(
                    Some(EndpointId::Local),
                    format!("Offer from localPeerConnection:\n{}", offer.sdp()),
                );
                self.publish();

                self.set_description(EndpointId::Local, DescriptionTarget::Local, offer.clone());
                self.relay(EndpointId::Local, SignalingMessage::offer(offer))
                    .await;
            }
            Completion::OfferCreated(Err(e)) => {
                self.fail(Error::DescriptionCreationFailed {
                    endpoint: EndpointId::Local,
                    reason: e.to_string(),
                })
                .await;
            }
            Completion::AnswerCreated(Ok(answer)) => {
                if let Err(e) = self.machine.answer_created(&answer) {
                    debug!(session_id = %self.id, "Dropping answer: {}", e);
                    return;
                }
                self.diagnostics.info(
                    Some(EndpointId::Remote),
                    format!("Answer from remotePeerConnection:\n{}", answer.sdp()),
                );
                self.publish();

                self.set_description(EndpointId::Remote, DescriptionTarget::Local, answer.clone());
                self.relay(EndpointId::Remote, SignalingMessage::answer(answer))
                    .await;
            }
            Completion::AnswerCreated(Err(e)) => {
                self.fail(Error::DescriptionCreationFailed {
                    endpoint: EndpointId::Remote,
                    reason: e.to_string(),
                })
                .await;
            }
            Completion::DescriptionSet {
                endpoint,
                target,
                result: Ok(()),
            } => {
                let operation = match target {
                    DescriptionTarget::Local => "setLocalDescription",
                    DescriptionTarget::Remote => "setRemoteDescription",
                };
                self.diagnostics
                    .info(Some(endpoint), format!("{} complete.", operation));

                match self.machine.description_set(endpoint, target) {
                    Ok(Some(NegotiationState::OfferApplied)) => {
                        info!(session_id = %self.id, "Offer applied on both endpoints");
                        self.publish();
                        self.create_answer();
                    }
                    Ok(Some(state)) => {
                        info!(session_id = %self.id, %state, "Negotiation complete");
                        self.publish();
                    }
                    Ok(None) => {}
                    Err(e) => debug!(session_id = %self.id, "Ignoring completion: {}", e),
                }
            }
            Completion::DescriptionSet {
                endpoint,
                target,
                result: Err(e),
            } => {
                self.fail(Error::DescriptionSetFailed {
                    endpoint,
                    target,
                    reason: e.to_string(),
                })
                .await;
            }
            Completion::CandidateApplied {
                endpoint,
                sequence,
                result,
            } => match result {
                Ok(()) => {
                    debug!(session_id = %self.id, %endpoint, sequence, "Candidate applied");
                    self.diagnostics
                        .info(Some(endpoint), "addIceCandidate success.");
                }
                Err(e) => {
                    let err = Error::CandidateApplyFailed {
                        endpoint,
                        reason: e.to_string(),
                    };
                    warn!(session_id = %self.id, %endpoint, sequence, "{}", err);
                    self.diagnostics.error(
                        Some(endpoint),
                        format!("failed to add ICE Candidate:\n{}.", e),
                    );
                }
            },
        }
    }

    async fn fail(&mut self, err: Error) {
        if !self.machine.fail() {
            debug!(session_id = %self.id, "Already settled; not escalating: {}", err);
            return;
        }

        error!(session_id = %self.id, endpoint = ?err.endpoint(), "Negotiation failed: {}", err);
        self.diagnostics.error(err.endpoint(), err.to_string());
        self.failure = Some(err);
        self.publish();

        self.data_path.close().await;
    }

    #[instrument(skip(self), fields(session_id = %self.id))]
    async fn hang_up(&mut self) {
        if self.machine.state() == NegotiationState::Closed {
            return;
        }

        self.diagnostics.info(None, "Ending call.");

        // Pending operations are abandoned
        self.inflight = FuturesUnordered::new();

        self.data_path.close().await;
        for endpoint in [&self.local, &self.remote] {
            if let Err(e) = endpoint.handle().close().await {
                warn!(endpoint = %endpoint.id(), "Failed to close peer connection: {}", e);
            }
        }

        self.machine.close();
        self.local.set_ice_state(IceConnectionState::Closed);
        self.remote.set_ice_state(IceConnectionState::Closed);
        self.publish();

        info!(
            local_candidates = self.local.candidates_discovered(),
            remote_candidates = self.remote.candidates_discovered(),
            "Session closed"
        );
    }
}
