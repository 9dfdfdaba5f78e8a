//! Relay contract and the in-process relay

use super::protocol::Envelope;
use crate::endpoint::EndpointId;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::trace;

/// Delivers a message from one endpoint to the other
///
/// No acknowledgment and no retry. A networked relay has to bring its own
/// reliability and ordering layer.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    async fn deliver(&self, envelope: Envelope) -> Result<()>;
}

/// Relay with one unbounded mailbox per endpoint
///
/// Delivery is immediate; each endpoint's inbox preserves the order in which
/// messages were delivered to it.
pub struct InProcessRelay {
    mailboxes: HashMap<EndpointId, UnboundedSender<Envelope>>,
    inboxes: Mutex<HashMap<EndpointId, UnboundedReceiver<Envelope>>>,
}

impl Default for InProcessRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessRelay {
    pub fn new() -> Self {
        let mut mailboxes = HashMap::new();
        let mut inboxes = HashMap::new();
        for endpoint in [EndpointId::Local, EndpointId::Remote] {
            let (tx, rx) = mpsc::unbounded();
            mailboxes.insert(endpoint, tx);
            inboxes.insert(endpoint, rx);
        }

        Self {
            mailboxes,
            inboxes: Mutex::new(inboxes),
        }
    }

    /// Messages addressed to `endpoint`; yielded once per endpoint
    pub fn take_inbox(&self, endpoint: EndpointId) -> Option<BoxStream<'static, Envelope>> {
        self.inboxes.lock().remove(&endpoint).map(|rx| rx.boxed())
    }
}

#[async_trait]
impl SignalingRelay for InProcessRelay {
    async fn deliver(&self, envelope: Envelope) -> Result<()> {
        if envelope.from == envelope.to {
            return Err(Error::SignalingError(format!(
                "{} cannot signal itself",
                envelope.from
            )));
        }

        let mailbox = self.mailboxes.get(&envelope.to).ok_or_else(|| {
            Error::SignalingError(format!("No mailbox for {}", envelope.to))
        })?;

        trace!(
            from = %envelope.from,
            to = %envelope.to,
            kind = envelope.message.kind(),
            "Relaying signaling message"
        );

        mailbox.unbounded_send(envelope).map_err(|e| {
            Error::SignalingError(format!(
                "Mailbox for {} is closed",
                e.into_inner().to
            ))
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::{IceCandidate, SessionDescription};
    use crate::signaling::SignalingMessage;

    #[tokio::test]
    async fn test_delivery_preserves_order_per_inbox() {
        let relay = InProcessRelay::new();
        let mut inbox = relay.take_inbox(EndpointId::Remote).unwrap();

        for sequence in 1..=3 {
            relay
                .deliver(Envelope::to_counterpart(
                    EndpointId::Local,
                    SignalingMessage::candidate(sequence, IceCandidate::new("candidate:x")),
                ))
                .await
                .unwrap();
        }
        relay
            .deliver(Envelope::to_counterpart(
                EndpointId::Local,
                SignalingMessage::offer(SessionDescription::offer("v=0")),
            ))
            .await
            .unwrap();

        let mut kinds = Vec::new();
        for _ in 0..4 {
            let envelope = inbox.next().await.unwrap();
            if let SignalingMessage::Candidate { sequence, .. } = envelope.message {
                kinds.push(format!("candidate-{}", sequence));
            } else {
                kinds.push(envelope.message.kind().to_string());
            }
        }
        assert_eq!(kinds, ["candidate-1", "candidate-2", "candidate-3", "offer"]);
    }

    #[tokio::test]
    async fn test_self_delivery_rejected() {
        let relay = InProcessRelay::new();
        let envelope = Envelope {
            from: EndpointId::Local,
            to: EndpointId::Local,
            message: SignalingMessage::offer(SessionDescription::offer("v=0")),
        };
        assert!(matches!(
            relay.deliver(envelope).await,
            Err(Error::SignalingError(_))
        ));
    }

    #[tokio::test]
    async fn test_delivery_to_dropped_inbox_fails() {
        let relay = InProcessRelay::new();
        drop(relay.take_inbox(EndpointId::Remote).unwrap());

        let result = relay
            .deliver(Envelope::to_counterpart(
                EndpointId::Local,
                SignalingMessage::offer(SessionDescription::offer("v=0")),
            ))
            .await;
        assert!(matches!(result, Err(Error::SignalingError(_))));
    }

    #[test]
    fn test_inbox_taken_once() {
        let relay = InProcessRelay::new();
        assert!(relay.take_inbox(EndpointId::Local).is_some());
        assert!(relay.take_inbox(EndpointId::Local).is_none());
    }
}
