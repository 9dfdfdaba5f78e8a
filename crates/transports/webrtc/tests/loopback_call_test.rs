//! Loopback Call Integration Tests
//!
//! Exercises the start / call / send / hang-up controls end to end over the
//! in-memory engine, for both data path variants.

mod harness;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use harness::{init_tracing, within};
use peerlink_webrtc::peer::OpKind;
use peerlink_webrtc::{
    ControlState, DataPathState, Error, LoopbackCall, MemoryEngine, MemoryPeerConfig,
    NegotiationConfig, NegotiationState, SyntheticCapture, TrackKind,
};
use tokio::sync::mpsc;

fn memory_call(config: NegotiationConfig) -> (LoopbackCall, Arc<MemoryEngine>) {
    memory_call_with(config, MemoryPeerConfig::default())
}

fn memory_call_with(
    config: NegotiationConfig,
    local: MemoryPeerConfig,
) -> (LoopbackCall, Arc<MemoryEngine>) {
    init_tracing();
    let engine = Arc::new(MemoryEngine::new(local, MemoryPeerConfig::default()));
    let capture = Arc::new(SyntheticCapture::new());
    let call = LoopbackCall::new(config, engine.clone(), capture).unwrap();
    (call, engine)
}

#[tokio::test]
async fn test_data_channel_round_trip() {
    // Offer creation is held back so the call is observed before the path opens
    let (mut call, engine) = memory_call_with(
        NegotiationConfig::data_channel(),
        MemoryPeerConfig::default().delay(OpKind::CreateOffer, Duration::from_millis(100)),
    );
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    call.on_receive(move |payload| {
        let _ = tx.send(payload);
    });

    call.start().await.unwrap();
    call.call().await.unwrap();
    assert_eq!(
        call.controls(),
        ControlState {
            start: false,
            call: false,
            hang_up: true,
            send: false
        }
    );

    let session = call.session().expect("call in progress");
    within("data path open", session.data_path().wait_for(DataPathState::Open))
        .await
        .unwrap();
    assert!(call.controls().send);
    assert!(session.data_path().setup_time().is_some());
    let snapshot = within("negotiation", session.settled()).await;
    assert_eq!(snapshot.state, NegotiationState::Negotiated);

    call.send("hello over the loop").await.unwrap();
    let received = within("payload delivered", rx.recv()).await.unwrap();
    assert_eq!(received, Bytes::from("hello over the loop"));

    let (local, remote) = engine.last_pair().unwrap();
    assert_eq!(local.channels()[0].sent(), vec![Bytes::from("hello over the loop")]);

    call.hang_up().await;
    assert_eq!(
        call.controls(),
        ControlState {
            start: false,
            call: true,
            hang_up: false,
            send: false
        }
    );
    assert!(local.is_closed());
    assert!(remote.is_closed());

    // Second hang-up is a no-op
    call.hang_up().await;
    assert!(call.controls().call);
}

#[tokio::test]
async fn test_oversized_payload_rejected() {
    let mut config = NegotiationConfig::data_channel();
    config.max_message_size = 16;
    let (mut call, _engine) = memory_call(config);

    call.start().await.unwrap();
    call.call().await.unwrap();
    let session = call.session().unwrap();
    within("data path open", session.data_path().wait_for(DataPathState::Open))
        .await
        .unwrap();

    let result = call.send(vec![0u8; 17]).await;
    assert!(matches!(result, Err(Error::DataChannelError(_))));
    call.send(vec![0u8; 16]).await.unwrap();

    call.hang_up().await;
}

#[tokio::test]
async fn test_call_again_after_hang_up() {
    let (mut call, engine) = memory_call(NegotiationConfig::data_channel());

    call.start().await.unwrap();
    call.call().await.unwrap();
    let first = call.session().unwrap().id();
    within("negotiation", call.session().unwrap().settled()).await;
    call.hang_up().await;

    call.call().await.unwrap();
    let second = call.session().unwrap().id();
    assert_ne!(first, second);
    let snapshot = within("negotiation", call.session().unwrap().settled()).await;
    assert_eq!(snapshot.state, NegotiationState::Negotiated);

    let (local, _) = engine.last_pair().unwrap();
    assert!(!local.is_closed());
    call.hang_up().await;
}

#[tokio::test]
async fn test_media_stream_call() {
    let (mut call, _engine) = memory_call(NegotiationConfig::media_stream());

    call.start().await.unwrap();
    let local_stream = call.local_stream().cloned().expect("local media acquired");
    assert_eq!(local_stream.video_tracks().count(), 1);
    assert_eq!(local_stream.audio_tracks().count(), 0);

    call.call().await.unwrap();
    let session = call.session().unwrap();
    within("remote stream", session.data_path().wait_for(DataPathState::Open))
        .await
        .unwrap();

    let remote_stream = session.data_path().remote_stream().expect("remote stream attached");
    assert_eq!(remote_stream.id, local_stream.id);
    assert_eq!(remote_stream.tracks[0].kind, TrackKind::Video);

    assert!(matches!(
        call.send("not on media").await,
        Err(Error::InvalidState(_))
    ));

    call.hang_up().await;
    assert!(call.session().is_none());
}

#[tokio::test]
async fn test_capture_failure_blocks_call() {
    init_tracing();
    let engine = Arc::new(MemoryEngine::default());
    let mut call = LoopbackCall::new(
        NegotiationConfig::media_stream(),
        engine.clone(),
        Arc::new(SyntheticCapture::failing("Permission denied")),
    )
    .unwrap();
    let mut diagnostics = call.diagnostics().subscribe();

    let err = call.start().await.unwrap_err();
    assert!(matches!(err, Error::CaptureFailed(_)));
    assert!(call.controls().start);
    assert!(matches!(call.call().await, Err(Error::InvalidState(_))));
    assert!(engine.last_pair().is_none());

    let mut saw_error = false;
    while let Ok(diagnostic) = diagnostics.try_recv() {
        saw_error |= diagnostic.message.contains("Permission denied");
    }
    assert!(saw_error);
}

#[tokio::test]
async fn test_failed_negotiation_surfaces_through_call() {
    init_tracing();
    let engine = Arc::new(MemoryEngine::new(
        MemoryPeerConfig::default(),
        MemoryPeerConfig::default().fail_on(OpKind::SetLocalDescription),
    ));
    let mut call = LoopbackCall::new(
        NegotiationConfig::data_channel(),
        engine,
        Arc::new(SyntheticCapture::new()),
    )
    .unwrap();

    call.start().await.unwrap();
    call.call().await.unwrap();
    let snapshot = within("settled", call.session().unwrap().settled()).await;
    assert_eq!(snapshot.state, NegotiationState::Failed);
    assert!(snapshot.failure.unwrap().is_session_fatal());
    assert!(!call.controls().send);

    call.hang_up().await;
    assert!(call.controls().call);
}
