//! Endpoint identity and ownership of one peer connection handle

use crate::peer::{IceConnectionState, PeerConnectionHandle};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// One side of a negotiation session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointId {
    /// Initiator: creates the offer
    Local,
    /// Responder: creates the answer
    Remote,
}

impl EndpointId {
    /// The counterpart endpoint
    pub fn other(self) -> Self {
        match self {
            EndpointId::Local => EndpointId::Remote,
            EndpointId::Remote => EndpointId::Local,
        }
    }

    /// Name used in human-readable diagnostics
    pub fn peer_name(self) -> &'static str {
        match self {
            EndpointId::Local => "localPeerConnection",
            EndpointId::Remote => "remotePeerConnection",
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.peer_name())
    }
}

/// An endpoint exclusively owns its peer connection handle.
///
/// The session holds the only long-lived reference; in-flight operations
/// borrow a clone of the handle for as long as they run.
pub struct Endpoint {
    id: EndpointId,
    handle: Arc<dyn PeerConnectionHandle>,
    /// Operations against the handle take turns in issuance order
    turns: Arc<tokio::sync::Mutex<()>>,
    discovered: u64,
    ice_state: IceConnectionState,
}

impl Endpoint {
    pub fn new(id: EndpointId, handle: Arc<dyn PeerConnectionHandle>) -> Self {
        Self {
            id,
            handle,
            turns: Arc::new(tokio::sync::Mutex::new(())),
            discovered: 0,
            ice_state: IceConnectionState::New,
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn handle(&self) -> &Arc<dyn PeerConnectionHandle> {
        &self.handle
    }

    /// Turn lock shared by every operation issued against this handle
    pub fn turns(&self) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.turns)
    }

    /// Assign the next discovery sequence number for a local candidate
    pub fn next_candidate_sequence(&mut self) -> u64 {
        self.discovered += 1;
        self.discovered
    }

    /// Number of local candidates discovered so far
    pub fn candidates_discovered(&self) -> u64 {
        self.discovered
    }

    pub fn ice_state(&self) -> IceConnectionState {
        self.ice_state
    }

    pub fn set_ice_state(&mut self, state: IceConnectionState) {
        self.ice_state = state;
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("discovered", &self.discovered)
            .field("ice_state", &self.ice_state)
            .finish()
    }
}
