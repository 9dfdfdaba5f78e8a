//! Configuration types for negotiation sessions

use serde::{Deserialize, Serialize};

/// Largest payload accepted by `DataPathController::send` by default
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65_535;

/// Hard upper bound for `max_message_size`
const MAX_MESSAGE_SIZE_LIMIT: usize = 262_144;

/// Main configuration for a negotiation session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// STUN server URLs (empty: host candidates only)
    pub ice_servers: Vec<String>,

    /// Kind of data path established once negotiation succeeds
    pub data_path: DataPathKind,

    /// Label of the send-side data channel (default: "sendDataChannel")
    pub channel_label: String,

    /// Data channel mode (default: Reliable)
    pub channel_mode: DataChannelMode,

    /// Options passed to create-offer
    pub offer_options: OfferOptions,

    /// What local media to request when the media-stream path is used
    pub media_constraints: MediaConstraints,

    /// Largest payload accepted by send (default: 65535 bytes)
    pub max_message_size: usize,
}

/// Variant of the data path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataPathKind {
    /// Send/receive data channel pair
    DataChannel,
    /// Local media attached to the initiator, remote stream surfaced on the responder
    MediaStream,
}

/// Data channel mode
///
/// Determines the reliability of message delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataChannelMode {
    /// Reliable, ordered delivery (default)
    Reliable,
    /// Unreliable, unordered delivery (low latency)
    Unreliable,
}

impl DataChannelMode {
    /// Get the ordered setting for webrtc-rs
    pub fn ordered(&self) -> bool {
        match self {
            DataChannelMode::Reliable => true,
            DataChannelMode::Unreliable => false,
        }
    }

    /// Get the max retransmits setting for webrtc-rs
    pub fn max_retransmits(&self) -> Option<u16> {
        match self {
            DataChannelMode::Reliable => None,      // Unlimited retransmits
            DataChannelMode::Unreliable => Some(0), // No retransmits
        }
    }
}

/// Options for create-offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfferOptions {
    /// Ask the answerer to send audio even if the offerer sends none
    pub offer_to_receive_audio: bool,
    /// Ask the answerer to send video even if the offerer sends none
    pub offer_to_receive_video: bool,
    /// Restart ICE with fresh credentials
    pub ice_restart: bool,
}

impl Default for OfferOptions {
    fn default() -> Self {
        Self {
            offer_to_receive_audio: false,
            offer_to_receive_video: true,
            ice_restart: false,
        }
    }
}

/// Local media request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: false,
            video: true,
        }
    }
}

impl MediaConstraints {
    /// Whether at least one kind of media is requested
    pub fn requests_any(&self) -> bool {
        self.audio || self.video
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            data_path: DataPathKind::DataChannel,
            channel_label: "sendDataChannel".to_string(),
            channel_mode: DataChannelMode::Reliable,
            offer_options: OfferOptions::default(),
            media_constraints: MediaConstraints::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl NegotiationConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - an ICE server URL does not use a `stun:`, `stuns:`, `turn:` or `turns:` scheme
    /// - `channel_label` is empty
    /// - `max_message_size` is not in range 1-262144
    /// - the media-stream path is selected but no media is requested
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        for url in &self.ice_servers {
            let known = ["stun:", "stuns:", "turn:", "turns:"]
                .iter()
                .any(|scheme| url.starts_with(scheme));
            if !known {
                return Err(Error::InvalidConfig(format!(
                    "ICE server URL must start with stun:, stuns:, turn: or turns:, got {}",
                    url
                )));
            }
        }

        if self.channel_label.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "channel_label must not be empty".to_string(),
            ));
        }

        if self.max_message_size == 0 || self.max_message_size > MAX_MESSAGE_SIZE_LIMIT {
            return Err(Error::InvalidConfig(format!(
                "max_message_size must be in range 1-{}, got {}",
                MAX_MESSAGE_SIZE_LIMIT, self.max_message_size
            )));
        }

        if self.data_path == DataPathKind::MediaStream && !self.media_constraints.requests_any() {
            return Err(Error::InvalidConfig(
                "media stream path requires audio or video in media_constraints".to_string(),
            ));
        }

        Ok(())
    }

    /// Data channel session with the default channel label
    pub fn data_channel() -> Self {
        Self::default()
    }

    /// Media stream session requesting video only
    pub fn media_stream() -> Self {
        Self {
            data_path: DataPathKind::MediaStream,
            ..Self::default()
        }
    }

    /// Replace the ICE server list
    ///
    /// Useful for chaining with preset methods.
    pub fn with_ice_servers(mut self, ice_servers: Vec<String>) -> Self {
        self.ice_servers = ice_servers;
        self
    }

    /// Set the data channel mode
    pub fn with_channel_mode(mut self, mode: DataChannelMode) -> Self {
        self.channel_mode = mode;
        self
    }
}
