//! Registry: TetherCore owns the local identity and every known device, and turns
//! freshly handshaken links into device links.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::device::{Device, DeviceContext};
use crate::error::{Error, Result};
use crate::identity::{DeviceId, Keypair};
use crate::link::{Link, PacketReceiver};
use crate::packet::Packet;
use crate::plugins::PluginTable;
use crate::protocol::{PeerIdentity, PACKET_TYPE_IDENTITY, PROTOCOL_VERSION};
use crate::store::TrustStore;
use crate::transfer::TransferCoordinator;

/// Main coordinator. Transports hand it links; clients query it for devices.
pub struct TetherCore {
    keypair: Keypair,
    ctx: DeviceContext,
    devices: Mutex<HashMap<DeviceId, Arc<Device>>>,
}

impl TetherCore {
    /// Build the registry and restore every stored device as trusted and unreachable.
    pub fn new(
        keypair: Keypair,
        config: CoreConfig,
        store: Arc<dyn TrustStore>,
        plugins: PluginTable,
    ) -> Result<Arc<Self>> {
        let ctx = DeviceContext {
            local_key: keypair.public_key().clone(),
            store: Arc::clone(&store),
            plugins: Arc::new(plugins),
            coordinator: TransferCoordinator::new(),
            config: Arc::new(config),
        };
        let own_id = keypair.device_id();
        let devices: HashMap<DeviceId, Arc<Device>> = store
            .load_all()?
            .into_iter()
            .filter(|record| record.id != own_id)
            .map(|record| (record.id, Device::restore(record, ctx.clone())))
            .collect();
        info!(device_id = %own_id, trusted = devices.len(), "core started");
        Ok(Arc::new(Self {
            keypair,
            ctx,
            devices: Mutex::new(devices),
        }))
    }

    pub fn device_id(&self) -> DeviceId {
        self.keypair.device_id()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn config(&self) -> &CoreConfig {
        &self.ctx.config
    }

    pub fn coordinator(&self) -> &TransferCoordinator {
        &self.ctx.coordinator
    }

    /// The packet a transport sends first on every new link.
    pub fn identity_packet(&self, tcp_port: Option<u16>) -> Packet {
        let config = &self.ctx.config;
        let mut packet = Packet::new(PACKET_TYPE_IDENTITY)
            .with_field("deviceId", self.device_id().to_string())
            .with_field("deviceName", &config.device_name)
            .with_field("deviceType", config.device_type.as_str())
            .with_field("protocolVersion", PROTOCOL_VERSION)
            .with_field(
                "incomingCapabilities",
                self.ctx.plugins.incoming_capabilities(),
            )
            .with_field(
                "outgoingCapabilities",
                self.ctx.plugins.outgoing_capabilities(),
            );
        if let Some(port) = tcp_port {
            packet = packet.with_field("tcpPort", port);
        }
        packet
    }

    /// Attach a handshaken link to the device it authenticates as, creating the device if it
    /// is new, and start pumping its inbound packets. A refused link is closed.
    pub async fn add_link(
        self: &Arc<Self>,
        identity: &Packet,
        link: Arc<dyn Link>,
        incoming: PacketReceiver,
    ) -> Result<Arc<Device>> {
        let identity = match self.check_identity(identity, link.as_ref()) {
            Ok(identity) => identity,
            Err(e) => {
                warn!(link = %link.id(), error = %e, "refusing link");
                link.close();
                return Err(e);
            }
        };
        let device_id = DeviceId::from_public_key(link.peer_key().as_bytes());

        // Held across the device update so a concurrent discard cannot orphan the device.
        let mut devices = self.devices.lock().await;
        let device = Arc::clone(devices.entry(device_id).or_insert_with(|| {
            info!(device = %device_id, name = %identity.device_name, "new device");
            Device::new(
                device_id,
                identity.device_name.clone(),
                identity.device_type,
                self.ctx.clone(),
            )
        }));
        if let Err(e) = device.add_link(&identity, Arc::clone(&link)).await {
            if !device.is_trusted().await && !device.is_reachable().await {
                devices.remove(&device_id);
            }
            return Err(e);
        }
        drop(devices);

        self.spawn_pump(Arc::clone(&device), link, incoming);
        Ok(device)
    }

    fn check_identity(&self, packet: &Packet, link: &dyn Link) -> Result<PeerIdentity> {
        let identity = PeerIdentity::from_packet(packet)?;
        let derived = DeviceId::from_public_key(link.peer_key().as_bytes());
        if let Some(claimed) = identity.device_id {
            if claimed != derived {
                return Err(Error::InvalidIdentity(format!(
                    "claimed id {claimed} does not match link credential {derived}"
                )));
            }
        }
        if derived == self.device_id() {
            return Err(Error::InvalidIdentity("link to ourselves".into()));
        }
        Ok(identity)
    }

    fn spawn_pump(
        self: &Arc<Self>,
        device: Arc<Device>,
        link: Arc<dyn Link>,
        mut incoming: PacketReceiver,
    ) {
        let core: Weak<TetherCore> = Arc::downgrade(self);
        tokio::spawn(async move {
            let closed = link.closed_token().clone();
            loop {
                let packet = tokio::select! {
                    _ = closed.cancelled() => break,
                    packet = incoming.recv() => match packet {
                        Some(packet) => packet,
                        None => break,
                    },
                };
                match device.receive_packet(link.id(), packet).await {
                    Ok(()) => {}
                    Err(Error::LinkClosed) => break,
                    Err(e) => debug!(device = %device.id(), link = %link.id(), error = %e, "packet dropped"),
                }
            }
            device.remove_link(link.id()).await;
            if let Some(core) = core.upgrade() {
                core.discard_if_idle(&device).await;
            }
        });
    }

    /// Forget a device that is neither trusted nor reachable.
    async fn discard_if_idle(&self, device: &Arc<Device>) {
        let mut devices = self.devices.lock().await;
        let same = devices
            .get(&device.id())
            .is_some_and(|known| Arc::ptr_eq(known, device));
        if same && !device.is_trusted().await && !device.is_reachable().await {
            debug!(device = %device.id(), "discarding device");
            devices.remove(&device.id());
        }
    }

    pub async fn devices(&self, only_reachable: bool, only_trusted: bool) -> Vec<Arc<Device>> {
        let all: Vec<Arc<Device>> = self.devices.lock().await.values().cloned().collect();
        let mut out = Vec::with_capacity(all.len());
        for device in all {
            if only_reachable && !device.is_reachable().await {
                continue;
            }
            if only_trusted && !device.is_trusted().await {
                continue;
            }
            out.push(device);
        }
        out.sort_by_key(|d| d.id());
        out
    }

    pub async fn device(&self, id: &DeviceId) -> Option<Arc<Device>> {
        self.devices.lock().await.get(id).cloned()
    }

    pub async fn device_id_by_name(&self, name: &str) -> Option<DeviceId> {
        for device in self.devices(false, false).await {
            if device.name().await == name {
                return Some(device.id());
            }
        }
        None
    }

    /// Unpair, disconnect and drop a device. Returns false if it was unknown.
    pub async fn forget_device(&self, id: &DeviceId) -> bool {
        let Some(device) = self.devices.lock().await.remove(id) else {
            return false;
        };
        device.unpair().await;
        for (link_id, _) in device.available_links().await {
            device.remove_link(&link_id).await;
        }
        info!(device = %id, "device forgotten");
        true
    }
}
