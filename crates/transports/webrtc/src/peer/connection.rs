//! webrtc-rs peer connection engine

use super::{HandlePair, IceConnectionState, PeerConnectionFactory, PeerConnectionHandle, PeerEvent};
use crate::channels::{DataChannelHandle, RtcDataChannel};
use crate::config::{DataChannelMode, NegotiationConfig, OfferOptions};
use crate::description::{IceCandidate, SdpType, SessionDescription};
use crate::endpoint::EndpointId;
use crate::media::{MediaStream, TrackKind};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection as WebRTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Peer connection handle backed by webrtc-rs
///
/// Wraps a webrtc::RTCPeerConnection and re-emits its callbacks as
/// [`PeerEvent`]s.
pub struct RtcPeerConnection {
    endpoint: EndpointId,
    peer_connection: Arc<WebRTCPeerConnection>,
    events_tx: UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<UnboundedReceiver<PeerEvent>>>,
    /// Kinds we send; receive-only transceivers are only added for the others
    sending: Mutex<Vec<TrackKind>>,
    /// Kept alive for as long as the connection sends them
    local_tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
}

impl RtcPeerConnection {
    /// Create a new peer connection
    ///
    /// # Arguments
    ///
    /// * `endpoint` - Which side of the session this handle serves
    /// * `config` - ICE servers and channel settings
    #[instrument(skip(config), fields(endpoint = %endpoint))]
    pub async fn new(endpoint: EndpointId, config: &NegotiationConfig) -> Result<Self> {
        info!("Creating peer connection");

        // Create MediaEngine with default codecs
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = config
            .ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection =
            Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
                Error::WebRtcError(format!("Failed to create peer connection: {}", e))
            })?);

        let (events_tx, events_rx) = mpsc::unbounded();
        let connection = Self {
            endpoint,
            peer_connection,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            sending: Mutex::new(Vec::new()),
            local_tracks: Mutex::new(Vec::new()),
        };

        connection.setup_handlers();

        Ok(connection)
    }

    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    fn setup_handlers(&self) {
        let tx = self.events_tx.clone();
        let endpoint = self.endpoint;
        self.peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!(%endpoint, "ICE gathering complete");
                    let _ = tx.unbounded_send(PeerEvent::IceCandidate(None));
                    return;
                };

                match candidate.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                        };
                        let _ = tx.unbounded_send(PeerEvent::IceCandidate(Some(candidate)));
                    }
                    Err(e) => {
                        warn!(%endpoint, "Failed to convert ICE candidate to JSON: {}", e);
                    }
                }
            })
        }));

        let tx = self.events_tx.clone();
        self.peer_connection
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let tx = tx.clone();
                Box::pin(async move {
                    let state = match state {
                        RTCIceConnectionState::New => IceConnectionState::New,
                        RTCIceConnectionState::Checking => IceConnectionState::Checking,
                        RTCIceConnectionState::Connected => IceConnectionState::Connected,
                        RTCIceConnectionState::Completed => IceConnectionState::Completed,
                        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
                        RTCIceConnectionState::Failed => IceConnectionState::Failed,
                        RTCIceConnectionState::Closed => IceConnectionState::Closed,
                        _ => return,
                    };
                    let _ = tx.unbounded_send(PeerEvent::IceConnectionStateChange(state));
                })
            }));

        let tx = self.events_tx.clone();
        self.peer_connection.on_data_channel(Box::new(move |rtc_channel| {
            let tx = tx.clone();
            Box::pin(async move {
                info!(%endpoint, label = rtc_channel.label(), "Remote data channel received");
                let channel: Arc<dyn DataChannelHandle> =
                    Arc::new(RtcDataChannel::from_rtc_channel(rtc_channel));
                let _ = tx.unbounded_send(PeerEvent::DataChannel(channel));
            })
        }));

        let tx = self.events_tx.clone();
        self.peer_connection
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let tx = tx.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        _ => return,
                    };
                    info!(%endpoint, %kind, "Remote track added");
                    let stream = MediaStream::new(track.stream_id()).with_track(kind, track.id());
                    let _ = tx.unbounded_send(PeerEvent::RemoteStream(stream));
                })
            }));
    }

    async fn add_receive_transceiver(&self, kind: RTPCodecType) -> Result<()> {
        self.peer_connection
            .add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| {
                Error::PeerConnectionError(format!("Failed to add {} transceiver: {}", kind, e))
            })?;
        Ok(())
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let sdp = description.sdp().to_string();
    let parsed = match description.sdp_type() {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
    };
    parsed.map_err(|e| {
        Error::WebRtcError(format!(
            "Failed to parse {}: {}",
            description.sdp_type(),
            e
        ))
    })
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(Error::WebRtcError(format!(
            "Unsupported session description type: {}",
            other
        ))),
    }
}

#[async_trait]
impl PeerConnectionHandle for RtcPeerConnection {
    async fn create_offer(&self, options: &OfferOptions) -> Result<SessionDescription> {
        let sending = self.sending.lock().clone();
        if options.offer_to_receive_video && !sending.contains(&TrackKind::Video) {
            self.add_receive_transceiver(RTPCodecType::Video).await?;
        }
        if options.offer_to_receive_audio && !sending.contains(&TrackKind::Audio) {
            self.add_receive_transceiver(RTPCodecType::Audio).await?;
        }

        let offer = self
            .peer_connection
            .create_offer(Some(RTCOfferOptions {
                ice_restart: options.ice_restart,
                ..Default::default()
            }))
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to create offer: {}", e)))?;

        debug!(endpoint = %self.endpoint, "Created SDP offer");
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to create answer: {}", e)))?;

        debug!(endpoint = %self.endpoint, "Created SDP answer");
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        self.peer_connection
            .set_local_description(description)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: None,
        };

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn create_data_channel(
        &self,
        label: &str,
        mode: DataChannelMode,
    ) -> Result<Arc<dyn DataChannelHandle>> {
        let channel = RtcDataChannel::create(&self.peer_connection, label, mode).await?;
        Ok(Arc::new(channel))
    }

    async fn add_stream(&self, stream: &MediaStream) -> Result<()> {
        for track in &stream.tracks {
            let mime_type = match track.kind {
                TrackKind::Video => MIME_TYPE_VP8,
                TrackKind::Audio => MIME_TYPE_OPUS,
            };
            let local_track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                track.label.clone(),
                stream.id.clone(),
            ));

            self.peer_connection
                .add_track(local_track.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| {
                    Error::PeerConnectionError(format!("Failed to add {} track: {}", track.kind, e))
                })?;

            self.sending.lock().push(track.kind);
            self.local_tracks.lock().push(local_track);
        }

        info!(endpoint = %self.endpoint, stream_id = %stream.id, "Added local stream");
        Ok(())
    }

    fn take_events(&self) -> Option<BoxStream<'static, PeerEvent>> {
        self.events_rx.lock().take().map(|rx| rx.boxed())
    }

    async fn close(&self) -> Result<()> {
        info!(endpoint = %self.endpoint, "Closing peer connection");

        self.events_tx.close_channel();
        self.local_tracks.lock().clear();

        self.peer_connection.close().await.map_err(|e| {
            Error::PeerConnectionError(format!("Failed to close connection: {}", e))
        })
    }
}

/// Factory producing a pair of webrtc-rs connections
#[derive(Debug, Clone, Copy, Default)]
pub struct RtcEngine;

#[async_trait]
impl PeerConnectionFactory for RtcEngine {
    async fn create_pair(&self, config: &NegotiationConfig) -> Result<HandlePair> {
        let local = RtcPeerConnection::new(EndpointId::Local, config).await?;
        let remote = match RtcPeerConnection::new(EndpointId::Remote, config).await {
            Ok(remote) => remote,
            Err(e) => {
                let _ = local.close().await;
                return Err(e);
            }
        };

        Ok(HandlePair {
            local: Arc::new(local),
            remote: Arc::new(remote),
        })
    }
}
