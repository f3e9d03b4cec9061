//! Tether core: device identity, pairing and link aggregation, plus deduplicated payload
//! transfers for capability plugins.
//!
//! Transports are supplied by the host. A transport authenticates a connection, wraps it in a
//! [`Link`] and hands it to [`TetherCore::add_link`] together with the peer's identity packet;
//! everything above that (trust, routing, plugins) lives here.

pub mod config;
pub mod core;
pub mod device;
pub mod error;
pub mod identity;
pub mod link;
pub mod packet;
pub mod pairing;
pub mod plugins;
pub mod protocol;
pub mod store;
pub mod transfer;
pub mod wire;

pub use crate::core::TetherCore;
pub use config::CoreConfig;
pub use device::{Device, DeviceEvent, DeviceType};
pub use error::{Error, Result};
pub use identity::{DeviceId, Keypair, PublicKey};
pub use link::{Link, LinkError, LinkId, LoopbackLink, PacketReceiver, TransportKind};
pub use packet::{Packet, Payload, PayloadReader};
pub use pairing::{PairState, PairingError};
pub use plugins::{NotificationSink, NotificationView, Plugin, PluginTable};
pub use protocol::{Message, PeerIdentity, PROTOCOL_VERSION};
pub use store::{DeviceRecord, MemoryTrustStore, StoreError, TrustStore};
pub use transfer::{TransferCoordinator, TransferError};
pub use wire::{decode_frame, decode_packet, encode_frame, encode_packet, FrameDecodeError, FrameEncodeError};
