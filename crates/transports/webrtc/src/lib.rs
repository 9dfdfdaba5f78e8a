//! Loopback WebRTC negotiation
//!
//! This crate negotiates a WebRTC session between two peer connections
//! living in the same process: the offer/answer exchange, ICE candidate
//! relay in both directions, and the lifecycle of the resulting data path.
//!
//! # Features
//!
//! - **Negotiation sessions**: offer/answer state machine driven by one task per session
//! - **ICE candidate relay**: candidates forwarded as discovered, independent of SDP progress
//! - **Data path controller**: data channel handshake or media stream attachment,
//!   send/receive, close
//! - **Pluggable engines**: `webrtc` crate peer connections or a deterministic in-memory engine
//! - **JSON signaling messages**: offer/answer/candidate envelopes over any relay
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │  LoopbackCall (start / call / send / hang-up)          │
//! │  ↓                                                     │
//! │  NegotiationSession (session task, tokio::select!)     │
//! │  ├─ NegotiationMachine (offer/answer states)          │
//! │  ├─ Endpoint Local  ── PeerConnectionHandle           │
//! │  ├─ Endpoint Remote ── PeerConnectionHandle           │
//! │  ├─ SignalingRelay (offer, answer, candidates)        │
//! │  └─ DataPathController (channel/stream lifecycle)     │
//! │     ↓                                                  │
//! │  RtcEngine (webrtc crate) | MemoryEngine (in-process)  │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use peerlink_webrtc::{DataChannelMode, DataPathKind, NegotiationConfig};
//!
//! let config = NegotiationConfig::data_channel()
//!     .with_ice_servers(vec!["stun:stun.l.google.com:19302".to_string()])
//!     .with_channel_mode(DataChannelMode::Unreliable);
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.data_path, DataPathKind::DataChannel);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use peerlink_webrtc::{LoopbackCall, NegotiationConfig, RtcEngine, SyntheticCapture};
//! use std::sync::Arc;
//!
//! # async fn example() -> peerlink_webrtc::Result<()> {
//! let mut call = LoopbackCall::new(
//!     NegotiationConfig::default(),
//!     Arc::new(RtcEngine),
//!     Arc::new(SyntheticCapture::new()),
//! )?;
//!
//! call.start().await?;
//! call.call().await?;
//! call.send("hello").await?;
//! call.hang_up().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod call;
pub mod channels;
pub mod config;
pub mod data_path;
pub mod description;
pub mod diagnostics;
pub mod endpoint;
pub mod error;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;

// Re-exports for public API
pub use call::{ControlState, LoopbackCall};
pub use channels::{ChannelEvent, DataChannelHandle, DataChannelState};
pub use config::{
    DataChannelMode, DataPathKind, MediaConstraints, NegotiationConfig, OfferOptions,
    DEFAULT_MAX_MESSAGE_SIZE,
};
pub use data_path::{DataPathController, DataPathState};
pub use description::{DescriptionTarget, IceCandidate, SdpType, SessionDescription};
pub use diagnostics::{Diagnostic, Diagnostics, Severity};
pub use endpoint::EndpointId;
pub use error::{Error, Result};
pub use media::{MediaCapture, MediaStream, MediaTrack, SyntheticCapture, TrackKind};
pub use peer::{
    HandlePair, IceConnectionState, MemoryEngine, MemoryPeerConfig, PeerConnectionFactory,
    PeerConnectionHandle, PeerEvent, RtcEngine,
};
pub use session::{NegotiationSession, NegotiationState, SessionId, SessionSnapshot};
pub use signaling::{Envelope, InProcessRelay, SignalingMessage, SignalingRelay};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
