//! Peer connection capability surface and engines
//!
//! [`PeerConnectionHandle`] is the contract the negotiation session drives.
//! Two engines implement it:
//!
//! - [`RtcPeerConnection`] over the webrtc-rs stack
//! - [`MemoryPeerConnection`], an in-process engine with scriptable
//!   latency and failures

mod connection;
mod memory;

pub use connection::{RtcEngine, RtcPeerConnection};
pub use memory::{MemoryDataChannel, MemoryEngine, MemoryPeerConfig, MemoryPeerConnection, OpKind};

use crate::channels::DataChannelHandle;
use crate::config::{DataChannelMode, NegotiationConfig, OfferOptions};
use crate::description::{IceCandidate, SessionDescription};
use crate::media::MediaStream;
use crate::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;

/// ICE connection state reported by a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// Whether a usable candidate pair has been found
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            IceConnectionState::Connected | IceConnectionState::Completed
        )
    }
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IceConnectionState::New => "new",
            IceConnectionState::Checking => "checking",
            IceConnectionState::Connected => "connected",
            IceConnectionState::Completed => "completed",
            IceConnectionState::Disconnected => "disconnected",
            IceConnectionState::Failed => "failed",
            IceConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Event raised by a peer connection handle
pub enum PeerEvent {
    /// Local candidate discovered; `None` marks end of candidates
    IceCandidate(Option<IceCandidate>),
    IceConnectionStateChange(IceConnectionState),
    /// Remote media arrived
    RemoteStream(MediaStream),
    /// Remote side opened a data channel
    DataChannel(Arc<dyn DataChannelHandle>),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            PeerEvent::IceConnectionStateChange(s) => {
                f.debug_tuple("IceConnectionStateChange").field(s).finish()
            }
            PeerEvent::RemoteStream(s) => f.debug_tuple("RemoteStream").field(&s.id).finish(),
            PeerEvent::DataChannel(c) => f.debug_tuple("DataChannel").field(&c.label()).finish(),
        }
    }
}

/// One side's media/data transport engine
///
/// Every operation is asynchronous and may suspend indefinitely. Events are
/// consumed as a lazy stream rather than through assignable callbacks.
#[async_trait]
pub trait PeerConnectionHandle: Send + Sync {
    async fn create_offer(&self, options: &OfferOptions) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn create_data_channel(
        &self,
        label: &str,
        mode: DataChannelMode,
    ) -> Result<Arc<dyn DataChannelHandle>>;

    /// Attach local media to be sent to the counterpart
    async fn add_stream(&self, stream: &MediaStream) -> Result<()>;

    /// Event stream of this handle
    ///
    /// Yielded once per handle; later calls return `None`. Events raised
    /// before the stream is taken are buffered. The stream ends at `close()`.
    fn take_events(&self) -> Option<BoxStream<'static, PeerEvent>>;

    /// Close the handle; it is unusable afterwards
    async fn close(&self) -> Result<()>;
}

/// The two handles of one call session
pub struct HandlePair {
    pub local: Arc<dyn PeerConnectionHandle>,
    pub remote: Arc<dyn PeerConnectionHandle>,
}

/// Creates the handles for a call session
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create_pair(&self, config: &NegotiationConfig) -> Result<HandlePair>;
}
