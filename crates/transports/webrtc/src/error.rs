//! Error types for negotiation and data path operations

use crate::description::DescriptionTarget;
use crate::endpoint::EndpointId;

/// Result type alias using the negotiation Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while negotiating or using a peer session
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Local media could not be acquired
    #[error("Media capture failed: {0}")]
    CaptureFailed(String),

    /// create-offer or create-answer failed on a handle
    #[error("Failed to create session description on {endpoint}: {reason}")]
    DescriptionCreationFailed {
        /// Endpoint whose handle failed
        endpoint: EndpointId,
        /// Engine-provided reason
        reason: String,
    },

    /// set-local-description or set-remote-description failed on a handle
    #[error("Failed to set {target} description on {endpoint}: {reason}")]
    DescriptionSetFailed {
        /// Endpoint whose handle failed
        endpoint: EndpointId,
        /// Which description slot was being set
        target: DescriptionTarget,
        /// Engine-provided reason
        reason: String,
    },

    /// add-ice-candidate failed on a handle
    #[error("Failed to add ICE candidate on {endpoint}: {reason}")]
    CandidateApplyFailed {
        /// Endpoint whose handle rejected the candidate
        endpoint: EndpointId,
        /// Engine-provided reason
        reason: String,
    },

    /// Operation invoked outside its valid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Send attempted before the data path's local half is open
    #[error("Data path not ready: {0}")]
    NotReady(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling relay error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Peer connection handle error outside of description handling
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),
}

impl Error {
    /// Check if this error moves a negotiation session to `Failed`
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::DescriptionCreationFailed { .. } | Error::DescriptionSetFailed { .. }
        )
    }

    /// Check if this error is a caller contract violation
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Error::InvalidState(_) | Error::NotReady(_))
    }

    /// Check if this error is only ever logged, never escalated
    pub fn is_logged_only(&self) -> bool {
        matches!(self, Error::CandidateApplyFailed { .. })
    }

    /// Endpoint the failure is attributed to, if any
    pub fn endpoint(&self) -> Option<EndpointId> {
        match self {
            Error::DescriptionCreationFailed { endpoint, .. }
            | Error::DescriptionSetFailed { endpoint, .. }
            | Error::CandidateApplyFailed { endpoint, .. } => Some(*endpoint),
            _ => None,
        }
    }
}
