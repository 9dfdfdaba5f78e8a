//! Data path lifecycle and the user-facing send/receive surface
//!
//! The data path is either a send/receive data channel pair or a media
//! stream attachment. Data channel halves report readiness independently;
//! the path is `Open` only once both halves are. A media path is `Open` as
//! soon as the remote stream arrives.

use crate::channels::{ChannelEvent, DataChannelHandle, DataChannelState};
use crate::config::DataPathKind;
use crate::diagnostics::Diagnostics;
use crate::endpoint::EndpointId;
use crate::media::MediaStream;
use crate::{Error, Result};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle state of a data path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataPathState {
    /// Nothing attached yet
    Unattached,
    /// At least one half attached, not yet open
    Attaching,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for DataPathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataPathState::Unattached => "unattached",
            DataPathState::Attaching => "attaching",
            DataPathState::Open => "open",
            DataPathState::Closing => "closing",
            DataPathState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Half {
    Send,
    Receive,
}

impl Half {
    fn endpoint(self) -> EndpointId {
        match self {
            Half::Send => EndpointId::Local,
            Half::Receive => EndpointId::Remote,
        }
    }
}

type ReceiveObserver = Arc<dyn Fn(Bytes) + Send + Sync>;

struct PathState {
    state: DataPathState,
    send: Option<Arc<dyn DataChannelHandle>>,
    send_state: DataChannelState,
    receive: Option<Arc<dyn DataChannelHandle>>,
    receive_state: DataChannelState,
    local_stream: Option<MediaStream>,
    remote_stream: Option<MediaStream>,
    opened_after: Option<Duration>,
    pumps: Vec<JoinHandle<()>>,
}

struct Inner {
    kind: DataPathKind,
    max_message_size: usize,
    created_at: Instant,
    diagnostics: Diagnostics,
    path: Mutex<PathState>,
    observer: Mutex<Option<ReceiveObserver>>,
    state_tx: watch::Sender<DataPathState>,
}

/// Bridges data path state to user-facing readiness
///
/// Cheap to clone; all clones share the same path.
#[derive(Clone)]
pub struct DataPathController {
    inner: Arc<Inner>,
}

impl fmt::Debug for DataPathController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataPathController")
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl DataPathController {
    pub fn new(kind: DataPathKind, max_message_size: usize, diagnostics: Diagnostics) -> Self {
        let (state_tx, _) = watch::channel(DataPathState::Unattached);
        Self {
            inner: Arc::new(Inner {
                kind,
                max_message_size,
                created_at: Instant::now(),
                diagnostics,
                path: Mutex::new(PathState {
                    state: DataPathState::Unattached,
                    send: None,
                    send_state: DataChannelState::Connecting,
                    receive: None,
                    receive_state: DataChannelState::Connecting,
                    local_stream: None,
                    remote_stream: None,
                    opened_after: None,
                    pumps: Vec::new(),
                }),
                observer: Mutex::new(None),
                state_tx,
            }),
        }
    }

    pub fn kind(&self) -> DataPathKind {
        self.inner.kind
    }

    /// Current state; a pure read
    pub fn state(&self) -> DataPathState {
        self.inner.path.lock().state
    }

    /// Readiness of the local (send) half
    pub fn send_state(&self) -> DataChannelState {
        self.inner.path.lock().send_state
    }

    /// Readiness of the remote (receive) half
    pub fn receive_state(&self) -> DataChannelState {
        self.inner.path.lock().receive_state
    }

    /// Time from creation to the first transition to `Open`
    pub fn setup_time(&self) -> Option<Duration> {
        self.inner.path.lock().opened_after
    }

    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.inner.path.lock().remote_stream.clone()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<DataPathState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the path reaches `state`
    ///
    /// Fails with `InvalidState` if the path closes first.
    pub async fn wait_for(&self, state: DataPathState) -> Result<()> {
        let mut rx = self.subscribe();
        let reached = rx
            .wait_for(|s| *s == state || *s == DataPathState::Closed)
            .await
            .map(|s| *s)
            .unwrap_or(DataPathState::Closed);

        if reached == state {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "data path closed while waiting for {}",
                state
            )))
        }
    }

    /// Register the observer for payloads arriving on the remote half
    pub fn on_receive<F>(&self, observer: F)
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        *self.inner.observer.lock() = Some(Arc::new(observer));
    }

    /// Attach the send-side channel created on the local handle
    pub fn attach_send(&self, channel: Arc<dyn DataChannelHandle>) {
        self.attach_channel(Half::Send, channel);
    }

    /// Attach the receive-side channel surfaced on the remote handle
    pub fn attach_receive(&self, channel: Arc<dyn DataChannelHandle>) {
        self.attach_channel(Half::Receive, channel);
    }

    /// Record the local media sent by the initiator
    pub fn attach_local_stream(&self, stream: MediaStream) {
        let mut path = self.inner.path.lock();
        if is_finished(path.state) {
            return;
        }
        path.local_stream = Some(stream);
        self.transition(&mut path, DataPathState::Attaching);
    }

    /// A remote stream arrived; opens a media path
    pub fn attach_remote_stream(&self, stream: MediaStream) {
        let mut path = self.inner.path.lock();
        if is_finished(path.state) {
            return;
        }
        if self.inner.kind != DataPathKind::MediaStream {
            debug!(stream_id = %stream.id, "Ignoring remote stream on data channel path");
            return;
        }

        info!(stream_id = %stream.id, tracks = stream.tracks.len(), "Remote stream attached");
        path.remote_stream = Some(stream);
        self.transition(&mut path, DataPathState::Open);
    }

    /// Transmit a payload over the local half
    ///
    /// Fails with `NotReady` unless the local half reports `Open`; nothing
    /// is transmitted in that case.
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        if self.inner.kind == DataPathKind::MediaStream {
            return Err(Error::InvalidState(
                "media stream paths carry no application payloads".to_string(),
            ));
        }

        let channel = {
            let path = self.inner.path.lock();
            match (&path.send, path.send_state) {
                (Some(channel), DataChannelState::Open) if !is_finished(path.state) => {
                    Arc::clone(channel)
                }
                (None, _) => {
                    return Err(Error::NotReady("no send channel attached".to_string()))
                }
                (Some(_), state) => {
                    return Err(Error::NotReady(format!(
                        "send channel is {} (path {})",
                        state, path.state
                    )))
                }
            }
        };

        if payload.len() > self.inner.max_message_size {
            return Err(Error::DataChannelError(format!(
                "Message size {} exceeds maximum {} bytes",
                payload.len(),
                self.inner.max_message_size
            )));
        }

        debug!(bytes = payload.len(), label = channel.label(), "Sending data");
        channel.send(payload).await
    }

    /// Close the path and the local channels
    ///
    /// `Open`/`Attaching` go through `Closing` to `Closed`. Idempotent; a
    /// call made while a teardown is already running waits for it.
    pub async fn close(&self) {
        let (closing, teardown) = {
            let mut path = self.inner.path.lock();
            let closing = path.state == DataPathState::Closing;
            (closing, Inner::begin_close(&self.inner, &mut path))
        };

        match teardown {
            Some(teardown) => Inner::finish_close(Arc::clone(&self.inner), teardown).await,
            None if closing => {
                let _ = self.wait_for(DataPathState::Closed).await;
            }
            None => {}
        }
    }

    fn attach_channel(&self, half: Half, channel: Arc<dyn DataChannelHandle>) {
        let events = channel.take_events();
        let initial = channel.ready_state();

        {
            let mut path = self.inner.path.lock();
            if is_finished(path.state) {
                drop(path);
                debug!(label = channel.label(), "Data path finished; closing late channel");
                tokio::spawn(async move {
                    let _ = channel.close().await;
                });
                return;
            }

            info!(?half, label = channel.label(), "Data channel attached");
            match half {
                Half::Send => path.send = Some(Arc::clone(&channel)),
                Half::Receive => path.receive = Some(Arc::clone(&channel)),
            }
            if path.state == DataPathState::Unattached {
                self.transition(&mut path, DataPathState::Attaching);
            }
        }

        if initial == DataChannelState::Open {
            Inner::half_changed(&self.inner, half, DataChannelState::Open);
        }

        let Some(mut events) = events else {
            warn!(?half, label = channel.label(), "Data channel events already taken");
            return;
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let pump = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                match event {
                    ChannelEvent::Open => Inner::half_changed(&inner, half, DataChannelState::Open),
                    ChannelEvent::Closed => {
                        Inner::half_changed(&inner, half, DataChannelState::Closed)
                    }
                    ChannelEvent::Message(payload) => inner.deliver(half, payload),
                }
            }
        });

        let mut path = self.inner.path.lock();
        if is_finished(path.state) {
            pump.abort();
        } else {
            path.pumps.push(pump);
        }
    }

    fn transition(&self, path: &mut PathState, next: DataPathState) {
        Inner::transition(&self.inner, path, next);
    }
}

/// Resources released when the path closes
struct Teardown {
    channels: Vec<Arc<dyn DataChannelHandle>>,
    pumps: Vec<JoinHandle<()>>,
}

fn is_finished(state: DataPathState) -> bool {
    matches!(state, DataPathState::Closing | DataPathState::Closed)
}

impl Inner {
    fn transition(inner: &Arc<Inner>, path: &mut PathState, next: DataPathState) {
        if path.state == next {
            return;
        }
        debug!(from = %path.state, to = %next, "Data path state change");
        path.state = next;

        if next == DataPathState::Open && path.opened_after.is_none() {
            let elapsed = inner.created_at.elapsed();
            path.opened_after = Some(elapsed);
            inner.diagnostics.info(
                None,
                format!("Setup time: {:.3}ms", elapsed.as_secs_f64() * 1000.0),
            );
        }

        inner.state_tx.send_replace(next);
    }

    fn half_changed(inner: &Arc<Inner>, half: Half, state: DataChannelState) {
        let mut path = inner.path.lock();
        let slot = match half {
            Half::Send => &mut path.send_state,
            Half::Receive => &mut path.receive_state,
        };
        if *slot == state {
            return;
        }
        *slot = state;

        let label = match half {
            Half::Send => "Send channel",
            Half::Receive => "Receive channel",
        };
        inner
            .diagnostics
            .info(Some(half.endpoint()), format!("{} state is: {}", label, state));

        if is_finished(path.state) {
            return;
        }

        let teardown = match state {
            DataChannelState::Open
                if path.send_state == DataChannelState::Open
                    && path.receive_state == DataChannelState::Open =>
            {
                Inner::transition(inner, &mut path, DataPathState::Open);
                None
            }
            // Counterpart went away
            DataChannelState::Closed => Inner::begin_close(inner, &mut path),
            _ => None,
        };
        drop(path);

        if let Some(teardown) = teardown {
            info!(?half, "Data channel closed by counterpart; closing path");
            tokio::spawn(Inner::finish_close(Arc::clone(inner), teardown));
        }
    }

    /// Move to `Closing` and take what must be released
    ///
    /// `None` if there is nothing left to release.
    fn begin_close(inner: &Arc<Inner>, path: &mut PathState) -> Option<Teardown> {
        match path.state {
            DataPathState::Closing | DataPathState::Closed => None,
            DataPathState::Unattached => {
                Inner::transition(inner, path, DataPathState::Closed);
                None
            }
            DataPathState::Attaching | DataPathState::Open => {
                Inner::transition(inner, path, DataPathState::Closing);
                path.local_stream = None;
                let channels = path.send.take().into_iter().chain(path.receive.take()).collect();
                Some(Teardown {
                    channels,
                    pumps: std::mem::take(&mut path.pumps),
                })
            }
        }
    }

    async fn finish_close(inner: Arc<Inner>, teardown: Teardown) {
        for channel in teardown.channels {
            if let Err(e) = channel.close().await {
                warn!(label = channel.label(), "Failed to close data channel: {}", e);
            }
        }
        for pump in teardown.pumps {
            pump.abort();
        }

        let mut path = inner.path.lock();
        path.send_state = DataChannelState::Closed;
        path.receive_state = DataChannelState::Closed;
        Inner::transition(&inner, &mut path, DataPathState::Closed);
    }

    fn deliver(&self, half: Half, payload: Bytes) {
        if half != Half::Receive {
            debug!(bytes = payload.len(), "Ignoring payload on send channel");
            return;
        }

        let observer = self.observer.lock().clone();
        match observer {
            Some(observer) => observer(payload),
            None => debug!(bytes = payload.len(), "No receive observer registered"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataChannelMode, OfferOptions, DEFAULT_MAX_MESSAGE_SIZE};
    use crate::peer::{MemoryPeerConnection, PeerConnectionHandle, PeerEvent};
    use async_trait::async_trait;
    use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
    use futures::stream::BoxStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Channel end whose events are driven by the test
    struct ScriptedChannel {
        state: Mutex<DataChannelState>,
        events_tx: UnboundedSender<ChannelEvent>,
        events_rx: Mutex<Option<UnboundedReceiver<ChannelEvent>>>,
        closes: AtomicUsize,
    }

    impl ScriptedChannel {
        fn new() -> Arc<Self> {
            let (events_tx, events_rx) = unbounded();
            Arc::new(Self {
                state: Mutex::new(DataChannelState::Connecting),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                closes: AtomicUsize::new(0),
            })
        }

        fn emit(&self, event: ChannelEvent) {
            match event {
                ChannelEvent::Open => *self.state.lock() = DataChannelState::Open,
                ChannelEvent::Closed => *self.state.lock() = DataChannelState::Closed,
                ChannelEvent::Message(_) => {}
            }
            let _ = self.events_tx.unbounded_send(event);
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DataChannelHandle for ScriptedChannel {
        fn label(&self) -> &str {
            "scripted"
        }

        fn ready_state(&self) -> DataChannelState {
            *self.state.lock()
        }

        async fn send(&self, _data: Bytes) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            *self.state.lock() = DataChannelState::Closed;
            Ok(())
        }

        fn take_events(&self) -> Option<BoxStream<'static, ChannelEvent>> {
            self.events_rx.lock().take().map(|rx| rx.boxed())
        }
    }

    fn controller(kind: DataPathKind) -> DataPathController {
        DataPathController::new(kind, DEFAULT_MAX_MESSAGE_SIZE, Diagnostics::new())
    }

    /// Connect a memory pair by hand and return both channel ends
    async fn linked_channels() -> (Arc<dyn DataChannelHandle>, Arc<dyn DataChannelHandle>) {
        let (local, remote) = MemoryPeerConnection::pair(Default::default(), Default::default());
        let mut remote_events = remote.take_events().unwrap();
        let send = local
            .create_data_channel("sendDataChannel", DataChannelMode::Reliable)
            .await
            .unwrap();

        let offer = local.create_offer(&OfferOptions::default()).await.unwrap();
        local.set_local_description(offer.clone()).await.unwrap();
        remote.set_remote_description(offer).await.unwrap();
        let answer = remote.create_answer().await.unwrap();
        remote.set_local_description(answer.clone()).await.unwrap();
        local.set_remote_description(answer).await.unwrap();
        local.add_ice_candidate(remote.local_candidates()[0].clone()).await.unwrap();
        remote.add_ice_candidate(local.local_candidates()[0].clone()).await.unwrap();

        loop {
            if let Some(PeerEvent::DataChannel(receive)) = remote_events.next().await {
                return (send, receive);
            }
        }
    }

    #[tokio::test]
    async fn test_initial_state() {
        let path = controller(DataPathKind::DataChannel);
        assert_eq!(path.state(), DataPathState::Unattached);
        assert_eq!(path.setup_time(), None);
    }

    #[tokio::test]
    async fn test_send_before_attach_is_not_ready() {
        let path = controller(DataPathKind::DataChannel);
        let result = path.send(Bytes::from_static(b"early")).await;
        assert!(matches!(result, Err(Error::NotReady(_))));
    }

    #[tokio::test]
    async fn test_send_while_connecting_never_transmits() {
        let (local, _remote) = MemoryPeerConnection::pair(Default::default(), Default::default());
        let channel = local
            .create_data_channel("sendDataChannel", DataChannelMode::Reliable)
            .await
            .unwrap();

        let path = controller(DataPathKind::DataChannel);
        path.attach_send(Arc::clone(&channel));
        assert_eq!(path.state(), DataPathState::Attaching);

        let result = path.send(Bytes::from_static(b"early")).await;
        assert!(matches!(result, Err(Error::NotReady(_))));
        assert!(local.channels()[0].sent().is_empty());
    }

    #[tokio::test]
    async fn test_open_requires_both_halves() {
        let (send, receive) = linked_channels().await;
        let path = controller(DataPathKind::DataChannel);

        path.attach_send(send);
        assert_eq!(path.send_state(), DataChannelState::Open);
        assert_eq!(path.state(), DataPathState::Attaching);

        path.attach_receive(receive);
        tokio::time::timeout(Duration::from_secs(1), path.wait_for(DataPathState::Open))
            .await
            .unwrap()
            .unwrap();
        assert!(path.setup_time().is_some());
    }

    #[tokio::test]
    async fn test_received_payloads_reach_observer() {
        let (send, receive) = linked_channels().await;
        let path = controller(DataPathKind::DataChannel);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        path.on_receive(move |payload| {
            let _ = tx.send(payload);
        });
        path.attach_send(send);
        path.attach_receive(receive);
        path.wait_for(DataPathState::Open).await.unwrap();

        path.send(Bytes::from_static(b"hello")).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let (send, receive) = linked_channels().await;
        let path = DataPathController::new(DataPathKind::DataChannel, 4, Diagnostics::new());
        path.attach_send(send);
        path.attach_receive(receive);

        let result = path.send(Bytes::from_static(b"too long")).await;
        assert!(matches!(result, Err(Error::DataChannelError(_))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (send, receive) = linked_channels().await;
        let path = controller(DataPathKind::DataChannel);
        let mut states = path.subscribe();
        path.attach_send(Arc::clone(&send));
        path.attach_receive(receive);
        path.wait_for(DataPathState::Open).await.unwrap();

        path.close().await;
        assert_eq!(path.state(), DataPathState::Closed);
        assert_eq!(send.ready_state(), DataChannelState::Closed);

        path.close().await;
        assert_eq!(path.state(), DataPathState::Closed);
        assert_eq!(*states.borrow_and_update(), DataPathState::Closed);

        let result = path.send(Bytes::from_static(b"late")).await;
        assert!(matches!(result, Err(Error::NotReady(_))));
    }

    #[tokio::test]
    async fn test_counterpart_close_releases_both_halves() {
        let send = ScriptedChannel::new();
        let receive = ScriptedChannel::new();
        let path = controller(DataPathKind::DataChannel);
        path.attach_send(send.clone());
        path.attach_receive(receive.clone());
        send.emit(ChannelEvent::Open);
        receive.emit(ChannelEvent::Open);
        tokio::time::timeout(Duration::from_secs(1), path.wait_for(DataPathState::Open))
            .await
            .unwrap()
            .unwrap();

        receive.emit(ChannelEvent::Closed);
        tokio::time::timeout(Duration::from_secs(1), path.wait_for(DataPathState::Closed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(send.closes(), 1);
        assert_eq!(receive.closes(), 1);
        assert_eq!(path.send_state(), DataChannelState::Closed);

        // Nothing left for an explicit close to release
        path.close().await;
        assert_eq!(path.state(), DataPathState::Closed);
        assert_eq!(send.closes(), 1);
        assert_eq!(receive.closes(), 1);

        let result = path.send(Bytes::from_static(b"late")).await;
        assert!(matches!(result, Err(Error::NotReady(_))));
    }

    #[tokio::test]
    async fn test_close_unattached() {
        let path = controller(DataPathKind::DataChannel);
        path.close().await;
        assert_eq!(path.state(), DataPathState::Closed);
    }

    #[tokio::test]
    async fn test_media_path_opens_on_remote_stream() {
        let path = controller(DataPathKind::MediaStream);
        path.attach_local_stream(MediaStream::new("local"));
        assert_eq!(path.state(), DataPathState::Attaching);

        path.attach_remote_stream(MediaStream::new("remote"));
        assert_eq!(path.state(), DataPathState::Open);
        assert_eq!(path.remote_stream().unwrap().id, "remote");

        let result = path.send(Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }
}
