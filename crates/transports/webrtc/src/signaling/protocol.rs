//! Signaling message types and their JSON wire format

use crate::description::{IceCandidate, SessionDescription};
use crate::endpoint::EndpointId;
use serde::{Deserialize, Serialize};

/// Message carried by the signaling relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    /// Session description produced by the initiator
    Offer { description: SessionDescription },

    /// Session description produced by the responder
    Answer { description: SessionDescription },

    /// Candidate discovered by the sender
    Candidate {
        /// Discovery sequence number on the sending endpoint, for diagnostics
        sequence: u64,
        candidate: IceCandidate,
    },
}

impl SignalingMessage {
    pub fn offer(description: SessionDescription) -> Self {
        SignalingMessage::Offer { description }
    }

    pub fn answer(description: SessionDescription) -> Self {
        SignalingMessage::Answer { description }
    }

    pub fn candidate(sequence: u64, candidate: IceCandidate) -> Self {
        SignalingMessage::Candidate {
            sequence,
            candidate,
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate { .. } => "candidate",
        }
    }

    /// Convert message to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to serialize signaling message: {}",
                e
            ))
        })
    }

    /// Parse message from JSON string
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to deserialize signaling message: {}",
                e
            ))
        })
    }
}

/// Unit of relay delivery: message plus routing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: EndpointId,
    pub to: EndpointId,
    pub message: SignalingMessage,
}

impl Envelope {
    /// Address a message from `from` to its counterpart
    pub fn to_counterpart(from: EndpointId, message: SignalingMessage) -> Self {
        Self {
            from,
            to: from.other(),
            message,
        }
    }

    /// Convert envelope to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize envelope: {}", e))
        })
    }

    /// Parse envelope from JSON string
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to deserialize envelope: {}", e))
        })
    }
}
