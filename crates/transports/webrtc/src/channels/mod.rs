//! Data channel capability surface
//!
//! A data channel is created on one peer connection handle (the send side)
//! and surfaces on the counterpart through a [`PeerEvent::DataChannel`]
//! event (the receive side). Both halves report their own readiness.
//!
//! [`PeerEvent::DataChannel`]: crate::peer::PeerEvent::DataChannel

mod data_channel;

pub use data_channel::RtcDataChannel;

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::fmt;

/// Data channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    /// Channel is being created
    Connecting,
    /// Channel is open and ready for messages
    Open,
    /// Channel is closing
    Closing,
    /// Channel is closed
    Closed,
}

impl fmt::Display for DataChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataChannelState::Connecting => f.write_str("connecting"),
            DataChannelState::Open => f.write_str("open"),
            DataChannelState::Closing => f.write_str("closing"),
            DataChannelState::Closed => f.write_str("closed"),
        }
    }
}

/// Event raised by a data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Bytes),
    Closed,
}

/// One end of a data channel
#[async_trait]
pub trait DataChannelHandle: Send + Sync {
    fn label(&self) -> &str;

    fn ready_state(&self) -> DataChannelState;

    /// Transmit a payload; no acknowledgment is modelled
    async fn send(&self, data: Bytes) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Event stream of this channel
    ///
    /// Yielded once; later calls return `None`. Events raised before the
    /// stream is taken are buffered. The stream ends once the channel closes.
    fn take_events(&self) -> Option<BoxStream<'static, ChannelEvent>>;
}

impl fmt::Debug for dyn DataChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannelHandle")
            .field("label", &self.label())
            .field("state", &self.ready_state())
            .finish()
    }
}
