//! webrtc-rs data channel adapter

use super::{ChannelEvent, DataChannelHandle, DataChannelState};
use crate::config::DataChannelMode;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;

/// Data channel backed by a webrtc-rs `RTCDataChannel`
///
/// The webrtc-rs `on_open` / `on_close` / `on_message` callbacks are
/// re-emitted as [`ChannelEvent`]s.
pub struct RtcDataChannel {
    label: String,
    rtc_channel: Arc<RTCDataChannel>,
    events_tx: UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<UnboundedReceiver<ChannelEvent>>>,
}

impl RtcDataChannel {
    /// Create a new data channel on an existing peer connection
    pub async fn create(
        peer_connection: &RTCPeerConnection,
        label: &str,
        mode: DataChannelMode,
    ) -> Result<Self> {
        use webrtc::data_channel::data_channel_init::RTCDataChannelInit;

        let init = RTCDataChannelInit {
            ordered: Some(mode.ordered()),
            max_retransmits: mode.max_retransmits(),
            ..Default::default()
        };

        let rtc_channel = peer_connection
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| {
                Error::DataChannelError(format!("Failed to create data channel: {}", e))
            })?;

        Ok(Self::from_rtc_channel(rtc_channel))
    }

    /// Wrap an existing RTCDataChannel (for incoming channels)
    pub fn from_rtc_channel(rtc_channel: Arc<RTCDataChannel>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded();
        let channel = Self {
            label: rtc_channel.label().to_string(),
            rtc_channel,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        };

        channel.setup_handlers();

        if channel.rtc_channel.ready_state() == RTCDataChannelState::Open {
            let _ = channel.events_tx.unbounded_send(ChannelEvent::Open);
        }

        channel
    }

    fn setup_handlers(&self) {
        let tx = self.events_tx.clone();
        let label = self.label.clone();
        self.rtc_channel.on_open(Box::new(move || {
            let tx = tx.clone();
            let label = label.clone();
            Box::pin(async move {
                debug!("Data channel '{}' opened", label);
                let _ = tx.unbounded_send(ChannelEvent::Open);
            })
        }));

        let tx = self.events_tx.clone();
        let label = self.label.clone();
        self.rtc_channel.on_close(Box::new(move || {
            let tx = tx.clone();
            let label = label.clone();
            Box::pin(async move {
                debug!("Data channel '{}' closed", label);
                let _ = tx.unbounded_send(ChannelEvent::Closed);
                tx.close_channel();
            })
        }));

        let tx = self.events_tx.clone();
        let label = self.label.clone();
        self.rtc_channel
            .on_message(Box::new(move |msg: DataChannelMessage| {
                let tx = tx.clone();
                let label = label.clone();
                Box::pin(async move {
                    debug!("Received {} bytes on data channel '{}'", msg.data.len(), label);
                    let _ = tx.unbounded_send(ChannelEvent::Message(msg.data));
                })
            }));

        let label = self.label.clone();
        self.rtc_channel.on_error(Box::new(move |err| {
            let label = label.clone();
            Box::pin(async move {
                error!("Data channel '{}' error: {}", label, err);
            })
        }));
    }
}

#[async_trait]
impl DataChannelHandle for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> DataChannelState {
        match self.rtc_channel.ready_state() {
            RTCDataChannelState::Open => DataChannelState::Open,
            RTCDataChannelState::Closing => DataChannelState::Closing,
            RTCDataChannelState::Closed => DataChannelState::Closed,
            _ => DataChannelState::Connecting,
        }
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        let state = self.ready_state();
        if state != DataChannelState::Open {
            return Err(Error::DataChannelError(format!(
                "Data channel '{}' is not open (state: {})",
                self.label, state
            )));
        }

        let sent = self
            .rtc_channel
            .send(&data)
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to send message: {}", e)))?;

        debug!("Sent {} bytes on data channel '{}'", sent, self.label);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        debug!("Closing data channel '{}'", self.label);

        self.rtc_channel
            .close()
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to close channel: {}", e)))?;

        Ok(())
    }

    fn take_events(&self) -> Option<BoxStream<'static, ChannelEvent>> {
        self.events_rx.lock().take().map(|rx| rx.boxed())
    }
}
