//! webrtc-rs Loopback Tests
//!
//! Negotiates two real `RTCPeerConnection`s against each other on host
//! candidates. Ignored by default: needs usable network interfaces.
//!
//! Run with `cargo test --test rtc_loopback_test -- --ignored`.

mod harness;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use harness::init_tracing;
use peerlink_webrtc::{
    DataPathState, LoopbackCall, NegotiationConfig, NegotiationState, RtcEngine, SyntheticCapture,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

#[tokio::test]
#[ignore = "requires network interfaces for ICE"]
async fn test_rtc_data_channel_loopback() {
    init_tracing();

    let mut call = LoopbackCall::new(
        NegotiationConfig::data_channel(),
        Arc::new(RtcEngine),
        Arc::new(SyntheticCapture::new()),
    )
    .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    call.on_receive(move |payload| {
        let _ = tx.send(payload);
    });

    call.start().await.unwrap();
    call.call().await.unwrap();

    let session = call.session().unwrap();
    let snapshot = timeout(CONNECT_TIMEOUT, session.settled()).await.unwrap();
    assert_eq!(snapshot.state, NegotiationState::Negotiated);
    timeout(CONNECT_TIMEOUT, session.data_path().wait_for(DataPathState::Open))
        .await
        .unwrap()
        .unwrap();

    call.send("ping").await.unwrap();
    let received = timeout(CONNECT_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received, Bytes::from("ping"));

    call.hang_up().await;
    assert!(call.controls().call);
}

#[tokio::test]
async fn test_rtc_offer_applied_without_network() {
    init_tracing();

    // Description exchange does not depend on ICE connectivity
    let mut call = LoopbackCall::new(
        NegotiationConfig::data_channel(),
        Arc::new(RtcEngine),
        Arc::new(SyntheticCapture::new()),
    )
    .unwrap();

    call.start().await.unwrap();
    call.call().await.unwrap();

    let session = call.session().unwrap();
    let snapshot = timeout(CONNECT_TIMEOUT, session.settled()).await.unwrap();
    assert_eq!(snapshot.state, NegotiationState::Negotiated);

    call.hang_up().await;
}
