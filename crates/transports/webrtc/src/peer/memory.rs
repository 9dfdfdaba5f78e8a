//! In-process peer connection engine
//!
//! Two [`MemoryPeerConnection`]s share a simulated wire. Each one gathers
//! its host candidates as soon as it exists. Its ICE state turns
//! `Connected` once both descriptions are set and a remote candidate has
//! been applied. Data channels and local streams cross the wire after both
//! sides are connected.

use super::{HandlePair, IceConnectionState, PeerConnectionFactory, PeerConnectionHandle, PeerEvent};
use crate::channels::{ChannelEvent, DataChannelHandle, DataChannelState};
use crate::config::{DataChannelMode, NegotiationConfig, OfferOptions};
use crate::description::{IceCandidate, SdpType, SessionDescription};
use crate::endpoint::EndpointId;
use crate::media::{MediaStream, TrackKind};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

/// Handle operations that can be delayed or made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddIceCandidate,
    CreateDataChannel,
    AddStream,
    Close,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpKind::CreateOffer => "createOffer",
            OpKind::CreateAnswer => "createAnswer",
            OpKind::SetLocalDescription => "setLocalDescription",
            OpKind::SetRemoteDescription => "setRemoteDescription",
            OpKind::AddIceCandidate => "addIceCandidate",
            OpKind::CreateDataChannel => "createDataChannel",
            OpKind::AddStream => "addStream",
            OpKind::Close => "close",
        };
        f.write_str(s)
    }
}

/// Behaviour of one in-memory handle
#[derive(Debug, Clone)]
pub struct MemoryPeerConfig {
    /// Host candidates gathered on creation
    pub candidates: usize,
    /// Artificial latency per operation
    pub delays: HashMap<OpKind, Duration>,
    /// Operations that fail
    pub failures: HashSet<OpKind>,
}

impl Default for MemoryPeerConfig {
    fn default() -> Self {
        Self {
            candidates: 2,
            delays: HashMap::new(),
            failures: HashSet::new(),
        }
    }
}

impl MemoryPeerConfig {
    pub fn with_candidates(mut self, candidates: usize) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn delay(mut self, op: OpKind, delay: Duration) -> Self {
        self.delays.insert(op, delay);
        self
    }

    pub fn fail_on(mut self, op: OpKind) -> Self {
        self.failures.insert(op);
        self
    }
}

#[derive(Default)]
struct Wire {
    peers: Mutex<Vec<Weak<MemoryPeerConnection>>>,
    linked: Mutex<bool>,
}

impl Wire {
    fn peers(&self) -> Option<(Arc<MemoryPeerConnection>, Arc<MemoryPeerConnection>)> {
        let peers = self.peers.lock();
        match (peers.first()?.upgrade(), peers.get(1)?.upgrade()) {
            (Some(a), Some(b)) => Some((a, b)),
            _ => None,
        }
    }

    fn counterpart(&self, endpoint: EndpointId) -> Option<Arc<MemoryPeerConnection>> {
        let (a, b) = self.peers()?;
        if a.endpoint == endpoint {
            Some(b)
        } else {
            Some(a)
        }
    }

    /// Link the pair once both sides are connected
    fn try_link(&self) {
        let Some((a, b)) = self.peers() else {
            return;
        };
        if !(a.ice_state().is_connected() && b.ice_state().is_connected()) {
            return;
        }

        {
            let mut linked = self.linked.lock();
            if *linked {
                return;
            }
            *linked = true;
        }

        debug!("Memory wire linked");
        self.deliver_pending();
    }

    fn deliver_pending(&self) {
        if !*self.linked.lock() {
            return;
        }
        let Some((a, b)) = self.peers() else {
            return;
        };
        a.flush_outgoing(&b);
        b.flush_outgoing(&a);
    }
}

#[derive(Default)]
struct PeerState {
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    applied: BTreeSet<IceCandidate>,
    ice: Option<IceConnectionState>,
    closed: bool,
    channels: Vec<Arc<MemoryDataChannel>>,
    outgoing_channels: Vec<Arc<MemoryDataChannel>>,
    streams: Vec<MediaStream>,
    outgoing_streams: Vec<MediaStream>,
    sdp_version: u64,
}

/// In-memory peer connection handle
pub struct MemoryPeerConnection {
    endpoint: EndpointId,
    config: MemoryPeerConfig,
    wire: Arc<Wire>,
    state: Mutex<PeerState>,
    events_tx: UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<UnboundedReceiver<PeerEvent>>>,
    log: Mutex<Vec<OpKind>>,
}

impl MemoryPeerConnection {
    /// Create a connected pair of handles; both start gathering immediately
    pub fn pair(local: MemoryPeerConfig, remote: MemoryPeerConfig) -> (Arc<Self>, Arc<Self>) {
        let wire = Arc::new(Wire::default());
        let local = Arc::new(Self::new(EndpointId::Local, local, Arc::clone(&wire)));
        let remote = Arc::new(Self::new(EndpointId::Remote, remote, Arc::clone(&wire)));
        *wire.peers.lock() = vec![Arc::downgrade(&local), Arc::downgrade(&remote)];

        local.gather();
        remote.gather();

        (local, remote)
    }

    fn new(endpoint: EndpointId, config: MemoryPeerConfig, wire: Arc<Wire>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded();
        Self {
            endpoint,
            config,
            wire,
            state: Mutex::new(PeerState::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    /// Host candidates this handle gathers, in discovery order
    pub fn local_candidates(&self) -> Vec<IceCandidate> {
        (1..=self.config.candidates)
            .map(|n| host_candidate(self.endpoint, n))
            .collect()
    }

    /// Remote candidates applied so far
    pub fn applied_candidates(&self) -> BTreeSet<IceCandidate> {
        self.state.lock().applied.clone()
    }

    /// Every operation issued against this handle, in issuance order
    pub fn operations(&self) -> Vec<OpKind> {
        self.log.lock().clone()
    }

    pub fn count(&self, op: OpKind) -> usize {
        self.log.lock().iter().filter(|o| **o == op).count()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local_description.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote_description.clone()
    }

    pub fn ice_state(&self) -> IceConnectionState {
        self.state.lock().ice.unwrap_or(IceConnectionState::New)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Data channels created on or received by this handle
    pub fn channels(&self) -> Vec<Arc<MemoryDataChannel>> {
        let state = self.state.lock();
        state
            .channels
            .iter()
            .chain(state.outgoing_channels.iter())
            .cloned()
            .collect()
    }

    fn emit(&self, event: PeerEvent) {
        trace!(endpoint = %self.endpoint, ?event, "Memory peer event");
        let _ = self.events_tx.unbounded_send(event);
    }

    fn gather(&self) {
        for candidate in self.local_candidates() {
            self.emit(PeerEvent::IceCandidate(Some(candidate)));
        }
        self.emit(PeerEvent::IceCandidate(None));
    }

    /// Record, delay and possibly fail an operation
    async fn begin(&self, op: OpKind) -> Result<()> {
        self.ensure_open(op)?;
        self.log.lock().push(op);

        if let Some(delay) = self.config.delays.get(&op) {
            tokio::time::sleep(*delay).await;
            self.ensure_open(op)?;
        }

        if self.config.failures.contains(&op) {
            return Err(Error::PeerConnectionError(format!(
                "{} failed on {} (injected)",
                op, self.endpoint
            )));
        }

        Ok(())
    }

    fn ensure_open(&self, op: OpKind) -> Result<()> {
        if self.state.lock().closed {
            return Err(Error::PeerConnectionError(format!(
                "{} on closed connection {}",
                op, self.endpoint
            )));
        }
        Ok(())
    }

    fn set_ice(state: &mut PeerState, ice: IceConnectionState) -> Option<IceConnectionState> {
        if state.ice == Some(ice) {
            return None;
        }
        state.ice = Some(ice);
        Some(ice)
    }

    /// Advance the ICE state after a description or candidate was applied
    fn check_connectivity(&self) {
        let changes = {
            let mut state = self.state.lock();
            let mut changes = Vec::new();
            if state.closed {
                return;
            }

            if state.ice.is_none() {
                changes.extend(Self::set_ice(&mut state, IceConnectionState::Checking));
            }

            let ready = state.local_description.is_some()
                && state.remote_description.is_some()
                && !state.applied.is_empty();
            let connected = state.ice.is_some_and(|s| s.is_connected());
            if ready && !connected {
                changes.extend(Self::set_ice(&mut state, IceConnectionState::Connected));
            }
            changes
        };

        for ice in changes {
            debug!(endpoint = %self.endpoint, %ice, "Memory ICE state");
            self.emit(PeerEvent::IceConnectionStateChange(ice));
        }

        self.wire.try_link();
    }

    fn flush_outgoing(&self, counterpart: &MemoryPeerConnection) {
        let (channels, streams) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let channels = std::mem::take(&mut state.outgoing_channels);
            state.channels.extend(channels.iter().cloned());
            let streams = std::mem::take(&mut state.outgoing_streams);
            (channels, streams)
        };

        for channel in channels {
            let remote_end = MemoryDataChannel::new(channel.label());
            MemoryDataChannel::link(&channel, &remote_end);
            counterpart.accept_channel(Arc::clone(&remote_end));
            channel.open();
            remote_end.open();
        }

        for stream in streams {
            counterpart.emit(PeerEvent::RemoteStream(stream));
        }
    }

    fn accept_channel(&self, channel: Arc<MemoryDataChannel>) {
        {
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                channel.shutdown();
                return;
            }
            state.channels.push(Arc::clone(&channel));
        }
        self.emit(PeerEvent::DataChannel(channel));
    }

    fn on_counterpart_closed(&self) {
        let change = {
            let mut state = self.state.lock();
            if state.closed || !state.ice.is_some_and(|s| s.is_connected()) {
                return;
            }
            Self::set_ice(&mut state, IceConnectionState::Disconnected)
        };
        if let Some(ice) = change {
            self.emit(PeerEvent::IceConnectionStateChange(ice));
        }
    }

    fn render_sdp(&self, sdp_type: SdpType, media_lines: &[String]) -> String {
        let version = {
            let mut state = self.state.lock();
            state.sdp_version += 1;
            state.sdp_version
        };
        let session_id = match self.endpoint {
            EndpointId::Local => 1001,
            EndpointId::Remote => 2002,
        };

        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=type:{}\r\n",
            session_id, version, sdp_type
        );
        for line in media_lines {
            sdp.push_str(line);
            sdp.push_str("\r\n");
        }
        sdp
    }
}

fn host_candidate(endpoint: EndpointId, n: usize) -> IceCandidate {
    let base_port = match endpoint {
        EndpointId::Local => 50_000,
        EndpointId::Remote => 51_000,
    };
    IceCandidate::new(format!(
        "candidate:{} 1 udp {} 127.0.0.1 {} typ host",
        n,
        2_130_706_431usize.saturating_sub(n),
        base_port + n
    ))
    .with_mid("0", 0)
}

fn media_lines(sdp: &str) -> Vec<String> {
    sdp.lines()
        .filter(|line| line.starts_with("m="))
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl PeerConnectionHandle for MemoryPeerConnection {
    async fn create_offer(&self, options: &OfferOptions) -> Result<SessionDescription> {
        self.begin(OpKind::CreateOffer).await?;

        let (has_channel, sends_video, sends_audio) = {
            let state = self.state.lock();
            let streams = state.streams.iter().chain(state.outgoing_streams.iter());
            let kinds: Vec<TrackKind> = streams
                .flat_map(|s| s.tracks.iter().map(|t| t.kind))
                .collect();
            (
                !state.channels.is_empty() || !state.outgoing_channels.is_empty(),
                kinds.contains(&TrackKind::Video),
                kinds.contains(&TrackKind::Audio),
            )
        };

        let mut lines = Vec::new();
        if sends_audio || options.offer_to_receive_audio {
            lines.push("m=audio 9 UDP/TLS/RTP/SAVPF 111".to_string());
        }
        if sends_video || options.offer_to_receive_video {
            lines.push("m=video 9 UDP/TLS/RTP/SAVPF 96".to_string());
        }
        if has_channel {
            lines.push("m=application 9 UDP/DTLS/SCTP webrtc-datachannel".to_string());
        }

        Ok(SessionDescription::offer(self.render_sdp(SdpType::Offer, &lines)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.begin(OpKind::CreateAnswer).await?;

        let offer = match self.state.lock().remote_description.clone() {
            Some(d) if d.sdp_type() == SdpType::Offer => d,
            _ => {
                return Err(Error::PeerConnectionError(
                    "createAnswer requires a remote offer".to_string(),
                ))
            }
        };

        let lines = media_lines(offer.sdp());
        Ok(SessionDescription::answer(self.render_sdp(SdpType::Answer, &lines)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.begin(OpKind::SetLocalDescription).await?;
        {
            let mut state = self.state.lock();
            let remote_type = state.remote_description.as_ref().map(|d| d.sdp_type());
            match (description.sdp_type(), remote_type) {
                (SdpType::Offer, Some(SdpType::Offer)) => {
                    return Err(Error::PeerConnectionError(
                        "cannot set local offer in have-remote-offer".to_string(),
                    ))
                }
                (SdpType::Answer, Some(SdpType::Offer)) => {}
                (SdpType::Answer, _) => {
                    return Err(Error::PeerConnectionError(
                        "cannot set local answer without a remote offer".to_string(),
                    ))
                }
                _ => {}
            }
            state.local_description = Some(description);
        }
        self.check_connectivity();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.begin(OpKind::SetRemoteDescription).await?;
        {
            let mut state = self.state.lock();
            let local_type = state.local_description.as_ref().map(|d| d.sdp_type());
            match (description.sdp_type(), local_type) {
                (SdpType::Offer, Some(SdpType::Offer)) => {
                    return Err(Error::PeerConnectionError(
                        "cannot set remote offer in have-local-offer".to_string(),
                    ))
                }
                (SdpType::Answer, Some(SdpType::Offer)) => {}
                (SdpType::Answer, _) => {
                    return Err(Error::PeerConnectionError(
                        "cannot set remote answer without a local offer".to_string(),
                    ))
                }
                _ => {}
            }
            state.remote_description = Some(description);
        }
        self.check_connectivity();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.begin(OpKind::AddIceCandidate).await?;
        if candidate.is_end_of_candidates() {
            return Ok(());
        }
        self.state.lock().applied.insert(candidate);
        self.check_connectivity();
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        mode: DataChannelMode,
    ) -> Result<Arc<dyn DataChannelHandle>> {
        self.begin(OpKind::CreateDataChannel).await?;
        debug!(endpoint = %self.endpoint, label, ?mode, "Memory data channel created");

        let channel = MemoryDataChannel::new(label);
        self.state.lock().outgoing_channels.push(Arc::clone(&channel));
        self.wire.deliver_pending();
        Ok(channel as Arc<dyn DataChannelHandle>)
    }

    async fn add_stream(&self, stream: &MediaStream) -> Result<()> {
        self.begin(OpKind::AddStream).await?;
        {
            let mut state = self.state.lock();
            state.streams.push(stream.clone());
            state.outgoing_streams.push(stream.clone());
        }
        self.wire.deliver_pending();
        Ok(())
    }

    fn take_events(&self) -> Option<BoxStream<'static, PeerEvent>> {
        self.events_rx.lock().take().map(|rx| rx.boxed())
    }

    async fn close(&self) -> Result<()> {
        self.log.lock().push(OpKind::Close);

        let channels = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.ice = Some(IceConnectionState::Closed);
            let mut channels = std::mem::take(&mut state.channels);
            channels.append(&mut state.outgoing_channels);
            channels
        };

        for channel in channels {
            channel.close_both();
        }

        self.emit(PeerEvent::IceConnectionStateChange(IceConnectionState::Closed));
        self.events_tx.close_channel();

        if let Some(counterpart) = self.wire.counterpart(self.endpoint) {
            counterpart.on_counterpart_closed();
        }

        debug!(endpoint = %self.endpoint, "Memory peer connection closed");
        Ok(())
    }
}

/// One end of an in-memory data channel
pub struct MemoryDataChannel {
    label: String,
    state: Mutex<DataChannelState>,
    peer: Mutex<Weak<MemoryDataChannel>>,
    events_tx: UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<UnboundedReceiver<ChannelEvent>>>,
    sent: Mutex<Vec<Bytes>>,
}

impl MemoryDataChannel {
    fn new(label: &str) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded();
        Arc::new(Self {
            label: label.to_string(),
            state: Mutex::new(DataChannelState::Connecting),
            peer: Mutex::new(Weak::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn link(a: &Arc<Self>, b: &Arc<Self>) {
        *a.peer.lock() = Arc::downgrade(b);
        *b.peer.lock() = Arc::downgrade(a);
    }

    fn open(&self) {
        let mut state = self.state.lock();
        if *state == DataChannelState::Connecting {
            *state = DataChannelState::Open;
            let _ = self.events_tx.unbounded_send(ChannelEvent::Open);
        }
    }

    fn receive(&self, data: Bytes) {
        if *self.state.lock() == DataChannelState::Open {
            let _ = self.events_tx.unbounded_send(ChannelEvent::Message(data));
        }
    }

    /// Returns false if the channel was already closed
    fn shutdown(&self) -> bool {
        let mut state = self.state.lock();
        if *state == DataChannelState::Closed {
            return false;
        }
        *state = DataChannelState::Closed;
        let _ = self.events_tx.unbounded_send(ChannelEvent::Closed);
        self.events_tx.close_channel();
        true
    }

    fn close_both(&self) {
        if self.shutdown() {
            if let Some(peer) = self.peer.lock().upgrade() {
                peer.shutdown();
            }
        }
    }

    /// Payloads transmitted on this end
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DataChannelHandle for MemoryDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> DataChannelState {
        *self.state.lock()
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        let state = self.ready_state();
        if state != DataChannelState::Open {
            return Err(Error::DataChannelError(format!(
                "Data channel '{}' is not open (state: {})",
                self.label, state
            )));
        }

        self.sent.lock().push(data.clone());
        let peer = self.peer.lock().upgrade();
        if let Some(peer) = peer {
            peer.receive(data);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_both();
        Ok(())
    }

    fn take_events(&self) -> Option<BoxStream<'static, ChannelEvent>> {
        self.events_rx.lock().take().map(|rx| rx.boxed())
    }
}

/// Factory producing in-memory handle pairs
///
/// Keeps every pair it created so tests can inspect the handles a call used.
#[derive(Default)]
pub struct MemoryEngine {
    local: MemoryPeerConfig,
    remote: MemoryPeerConfig,
    pairs: Mutex<Vec<(Arc<MemoryPeerConnection>, Arc<MemoryPeerConnection>)>>,
}

impl MemoryEngine {
    pub fn new(local: MemoryPeerConfig, remote: MemoryPeerConfig) -> Self {
        Self {
            local,
            remote,
            pairs: Mutex::new(Vec::new()),
        }
    }

    /// Most recently created pair
    pub fn last_pair(&self) -> Option<(Arc<MemoryPeerConnection>, Arc<MemoryPeerConnection>)> {
        self.pairs.lock().last().cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for MemoryEngine {
    async fn create_pair(&self, _config: &NegotiationConfig) -> Result<HandlePair> {
        let (local, remote) = MemoryPeerConnection::pair(self.local.clone(), self.remote.clone());
        self.pairs.lock().push((Arc::clone(&local), Arc::clone(&remote)));
        Ok(HandlePair { local, remote })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(events: &mut BoxStream<'static, PeerEvent>, n: usize) -> Vec<PeerEvent> {
        let mut out = Vec::new();
        for _ in 0..n {
            out.push(events.next().await.unwrap());
        }
        out
    }

    async fn exchange(local: &MemoryPeerConnection, remote: &MemoryPeerConnection) {
        let offer = local.create_offer(&OfferOptions::default()).await.unwrap();
        local.set_local_description(offer.clone()).await.unwrap();
        remote.set_remote_description(offer).await.unwrap();
        let answer = remote.create_answer().await.unwrap();
        remote.set_local_description(answer.clone()).await.unwrap();
        local.set_remote_description(answer).await.unwrap();
    }

    #[tokio::test]
    async fn test_gathers_candidates_then_end_marker() {
        let (local, _remote) = MemoryPeerConnection::pair(
            MemoryPeerConfig::default().with_candidates(3),
            Default::default(),
        );
        let mut events = local.take_events().unwrap();

        let gathered = drain(&mut events, 4).await;
        for event in &gathered[..3] {
            assert!(matches!(event, PeerEvent::IceCandidate(Some(_))));
        }
        assert!(matches!(gathered[3], PeerEvent::IceCandidate(None)));
        assert!(local.take_events().is_none());
    }

    #[tokio::test]
    async fn test_connects_after_descriptions_and_candidate() {
        let (local, remote) = MemoryPeerConnection::pair(Default::default(), Default::default());
        exchange(&local, &remote).await;
        assert!(!local.ice_state().is_connected());

        local.add_ice_candidate(remote.local_candidates()[0].clone()).await.unwrap();
        remote.add_ice_candidate(local.local_candidates()[0].clone()).await.unwrap();

        assert_eq!(local.ice_state(), IceConnectionState::Connected);
        assert_eq!(remote.ice_state(), IceConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_answer_requires_remote_offer() {
        let (_local, remote) = MemoryPeerConnection::pair(Default::default(), Default::default());
        assert!(remote.create_answer().await.is_err());
    }

    #[tokio::test]
    async fn test_channel_crosses_wire_once_linked() {
        let (local, remote) = MemoryPeerConnection::pair(
            MemoryPeerConfig::default().with_candidates(1),
            MemoryPeerConfig::default().with_candidates(1),
        );
        let mut remote_events = remote.take_events().unwrap();
        let channel = local
            .create_data_channel("sendDataChannel", DataChannelMode::Reliable)
            .await
            .unwrap();
        assert_eq!(channel.ready_state(), DataChannelState::Connecting);

        exchange(&local, &remote).await;
        local.add_ice_candidate(remote.local_candidates()[0].clone()).await.unwrap();
        remote.add_ice_candidate(local.local_candidates()[0].clone()).await.unwrap();

        assert_eq!(channel.ready_state(), DataChannelState::Open);

        let mut received = None;
        while let Some(event) = remote_events.next().await {
            if let PeerEvent::DataChannel(c) = event {
                received = Some(c);
                break;
            }
        }
        let received = received.unwrap();
        assert_eq!(received.label(), "sendDataChannel");
        assert_eq!(received.ready_state(), DataChannelState::Open);

        let mut channel_events = received.take_events().unwrap();
        assert_eq!(channel_events.next().await, Some(ChannelEvent::Open));

        channel.send(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(
            channel_events.next().await,
            Some(ChannelEvent::Message(Bytes::from_static(b"hi")))
        );

        channel.close().await.unwrap();
        assert_eq!(received.ready_state(), DataChannelState::Closed);
        assert_eq!(channel_events.next().await, Some(ChannelEvent::Closed));
        assert_eq!(channel_events.next().await, None);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let (local, _remote) = MemoryPeerConnection::pair(
            MemoryPeerConfig::default().fail_on(OpKind::CreateOffer),
            Default::default(),
        );
        let result = local.create_offer(&OfferOptions::default()).await;
        assert!(matches!(result, Err(Error::PeerConnectionError(_))));
        assert_eq!(local.operations(), vec![OpKind::CreateOffer]);
    }

    #[tokio::test]
    async fn test_candidate_application_is_commutative() {
        let (a, _) = MemoryPeerConnection::pair(Default::default(), Default::default());
        let (b, remote) = MemoryPeerConnection::pair(Default::default(), Default::default());
        let candidates = remote.local_candidates();

        a.add_ice_candidate(candidates[0].clone()).await.unwrap();
        a.add_ice_candidate(candidates[1].clone()).await.unwrap();
        b.add_ice_candidate(candidates[1].clone()).await.unwrap();
        b.add_ice_candidate(candidates[0].clone()).await.unwrap();

        assert_eq!(a.applied_candidates(), b.applied_candidates());
    }

    #[tokio::test]
    async fn test_operations_fail_after_close() {
        let (local, remote) = MemoryPeerConnection::pair(Default::default(), Default::default());
        let mut events = local.take_events().unwrap();

        local.close().await.unwrap();
        local.close().await.unwrap();

        assert!(local.is_closed());
        assert!(local.create_offer(&OfferOptions::default()).await.is_err());
        assert!(!remote.is_closed());

        // Buffered events drain, then the stream ends
        while events.next().await.is_some() {}
    }
}
