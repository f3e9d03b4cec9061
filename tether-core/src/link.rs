//! Links: one transport-level connection to a peer.
//!
//! A link is a trait object with per-transport structs behind it, tagged by
//! [`TransportKind`]. Sending goes through [`Link::send`]; inbound packets are delivered to
//! the owner over the `mpsc` receiver the transport hands out together with the link.

use std::fmt;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::identity::PublicKey;
use crate::packet::{Packet, Payload};
use crate::wire::FrameEncodeError;

/// Unique per connection; a reconnect gets a new id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkId(String);

impl LinkId {
    pub fn generate() -> Self {
        LinkId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process pair of endpoints.
    Loopback,
    /// Encrypted TCP on the local network.
    Lan,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Loopback => f.write_str("loopback"),
            TransportKind::Lan => f.write_str("lan"),
        }
    }
}

#[async_trait]
pub trait Link: Send + Sync {
    fn id(&self) -> &LinkId;

    fn transport(&self) -> TransportKind;

    /// Credential the peer proved during the transport handshake.
    fn peer_key(&self) -> &PublicKey;

    /// Send one packet. Packets sent on the same link arrive in send order.
    async fn send(&self, packet: &Packet) -> Result<(), LinkError>;

    /// Cancelled when the link closes. Payloads received on the link hold a child of it.
    fn closed_token(&self) -> &CancellationToken;

    /// Tear the connection down. Idempotent.
    fn close(&self) {
        self.closed_token().cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed_token().is_cancelled()
    }
}

/// Inbound side of a link as handed to the owner by the transport.
pub type PacketReceiver = mpsc::UnboundedReceiver<Packet>;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link closed")]
    Closed,
    #[error("encode error: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("transport error: {0}")]
    Transport(String),
}

/// In-process link. Two ends are created together; what one end sends the other receives.
pub struct LoopbackLink {
    id: LinkId,
    peer_key: PublicKey,
    outbound: mpsc::UnboundedSender<Packet>,
    closed: CancellationToken,
}

impl LoopbackLink {
    /// Create two connected ends. The first end talks to a peer holding `b_key`, the second to
    /// a peer holding `a_key`. Closing either end closes both.
    pub fn pair(
        a_key: PublicKey,
        b_key: PublicKey,
    ) -> (
        (Arc<LoopbackLink>, PacketReceiver),
        (Arc<LoopbackLink>, PacketReceiver),
    ) {
        let (to_a, a_rx) = mpsc::unbounded_channel();
        let (to_b, b_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let a = Arc::new(LoopbackLink {
            id: LinkId::generate(),
            peer_key: b_key,
            outbound: to_b,
            closed: closed.clone(),
        });
        let b = Arc::new(LoopbackLink {
            id: LinkId::generate(),
            peer_key: a_key,
            outbound: to_a,
            closed,
        });
        ((a, a_rx), (b, b_rx))
    }

    /// Re-home the sender's payload on this link so the receiver observes this link closing.
    fn forward_payload(&self, packet: &Packet) -> Packet {
        let Some(source) = packet.payload().cloned() else {
            return packet.clone();
        };
        let size = source.size();
        let payload = Payload::deferred(
            size,
            Box::new(move || {
                async move {
                    source
                        .open()
                        .await
                        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
                }
                .boxed()
            }),
        )
        .with_source_token(self.closed.child_token());
        packet.clone().with_payload(payload)
    }
}

#[async_trait]
impl Link for LoopbackLink {
    fn id(&self) -> &LinkId {
        &self.id
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Loopback
    }

    fn peer_key(&self) -> &PublicKey {
        &self.peer_key
    }

    async fn send(&self, packet: &Packet) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        self.outbound
            .send(self.forward_payload(packet))
            .map_err(|_| LinkError::Closed)
    }

    fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }
}
