//! Tether protocol: version, packet type tags, discovery messages.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::device::DeviceType;
use crate::error::{Error, Result};
use crate::identity::{DeviceId, PublicKey};
use crate::packet::Packet;

/// Current protocol version. Used in beacon, link handshake and identity packet.
pub const PROTOCOL_VERSION: u8 = 1;

pub const PACKET_TYPE_IDENTITY: &str = "tether.identity";
pub const PACKET_TYPE_PAIR: &str = "tether.pair";
pub const PACKET_TYPE_PING: &str = "tether.ping";
pub const PACKET_TYPE_NOTIFICATION: &str = "tether.notification";
pub const PACKET_TYPE_NOTIFICATION_REQUEST: &str = "tether.notification.request";
pub const PACKET_TYPE_NOTIFICATION_ACTION: &str = "tether.notification.action";
pub const PACKET_TYPE_NOTIFICATION_REPLY: &str = "tether.notification.reply";

/// Packet types handled by the device itself rather than by a plugin.
pub fn is_pairing_control(packet_type: &str) -> bool {
    packet_type == PACKET_TYPE_PAIR
}

/// Discovery messages. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Advertise presence: device ID, public key, protocol version, name, TCP listen port.
    Beacon {
        protocol_version: u8,
        device_id: DeviceId,
        public_key: PublicKey,
        device_name: String,
        listen_port: u16,
    },
    /// Response to beacon: ack and advertise self.
    DiscoveryResponse {
        protocol_version: u8,
        device_id: DeviceId,
        public_key: PublicKey,
        device_name: String,
        listen_port: u16,
    },
}

/// What a peer tells us about itself in its `tether.identity` packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Claimed id; checked against the link's credential by the registry.
    pub device_id: Option<DeviceId>,
    pub device_name: String,
    pub device_type: DeviceType,
    pub protocol_version: Option<u8>,
    pub incoming_capabilities: BTreeSet<String>,
    pub outgoing_capabilities: BTreeSet<String>,
    pub tcp_port: Option<u16>,
}

impl PeerIdentity {
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if packet.packet_type() != PACKET_TYPE_IDENTITY {
            return Err(Error::InvalidIdentity(format!(
                "expected {PACKET_TYPE_IDENTITY}, got {}",
                packet.packet_type()
            )));
        }
        let device_id = match packet.get::<String>("deviceId") {
            Some(s) => Some(
                s.parse::<DeviceId>()
                    .map_err(|e| Error::InvalidIdentity(format!("deviceId: {e}")))?,
            ),
            None => None,
        };
        let device_name = packet
            .get::<String>("deviceName")
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::InvalidIdentity("missing deviceName".into()))?;
        Ok(Self {
            device_id,
            device_name,
            device_type: packet
                .get::<String>("deviceType")
                .map(DeviceType::from)
                .unwrap_or_default(),
            protocol_version: packet.get("protocolVersion"),
            incoming_capabilities: packet.get_or("incomingCapabilities", BTreeSet::new()),
            outgoing_capabilities: packet.get_or("outgoingCapabilities", BTreeSet::new()),
            tcp_port: packet.get("tcpPort"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn minimal_identity() {
        let p = Packet::new(PACKET_TYPE_IDENTITY)
            .with_field("deviceName", "Phone1")
            .with_field("deviceType", "Phone");
        let id = PeerIdentity::from_packet(&p).unwrap();
        assert_eq!(id.device_name, "Phone1");
        assert_eq!(id.device_type, DeviceType::Phone);
        assert!(id.device_id.is_none());
        assert!(id.incoming_capabilities.is_empty());
    }

    #[test]
    fn full_identity() {
        let kp = Keypair::generate();
        let p = Packet::new(PACKET_TYPE_IDENTITY)
            .with_field("deviceId", kp.device_id().to_string())
            .with_field("deviceName", "laptop")
            .with_field("deviceType", "laptop")
            .with_field("protocolVersion", PROTOCOL_VERSION)
            .with_field("incomingCapabilities", vec![PACKET_TYPE_PING])
            .with_field("outgoingCapabilities", vec![PACKET_TYPE_PING, PACKET_TYPE_NOTIFICATION])
            .with_field("tcpPort", 1716);
        let id = PeerIdentity::from_packet(&p).unwrap();
        assert_eq!(id.device_id, Some(kp.device_id()));
        assert_eq!(id.protocol_version, Some(PROTOCOL_VERSION));
        assert_eq!(id.outgoing_capabilities.len(), 2);
        assert_eq!(id.tcp_port, Some(1716));
    }

    #[test]
    fn rejects_bad_identity() {
        let wrong_type = Packet::new(PACKET_TYPE_PING).with_field("deviceName", "x");
        assert!(matches!(
            PeerIdentity::from_packet(&wrong_type),
            Err(Error::InvalidIdentity(_))
        ));
        let no_name = Packet::new(PACKET_TYPE_IDENTITY).with_field("deviceName", "  ");
        assert!(PeerIdentity::from_packet(&no_name).is_err());
        let bad_id = Packet::new(PACKET_TYPE_IDENTITY)
            .with_field("deviceName", "x")
            .with_field("deviceId", "zz");
        assert!(PeerIdentity::from_packet(&bad_id).is_err());
    }
}
