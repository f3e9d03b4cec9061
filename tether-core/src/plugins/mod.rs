//! Capability handlers.
//!
//! Plugins are registered up front in a [`PluginTable`]: a name, the packet types the plugin
//! accepts and sends, and a factory. A device instantiates a plugin only while it is trusted
//! and reachable, and drops every instance the moment either stops being true.

pub mod notifications;
pub mod ping;

use std::any::Any;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::config::CoreConfig;
use crate::device::Device;
use crate::identity::DeviceId;
use crate::packet::Packet;
use crate::transfer::TransferCoordinator;

pub use notifications::{Notification, NotificationsPlugin};
pub use ping::{send_ping, PingPlugin};

#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Handle a packet of one of the plugin's incoming types. Returns false if it was ignored.
    async fn receive_packet(&self, packet: &Packet) -> bool;

    /// Called once per instance, after the device lock is released.
    async fn connected(&self) {}

    /// For typed access through [`Device::plugin_as`].
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Handed to a factory when a device instantiates the plugin.
#[derive(Clone)]
pub struct PluginContext {
    /// Weak so a plugin never keeps its device alive.
    pub device: Weak<Device>,
    pub device_id: DeviceId,
    /// Name when the plugin was loaded. [`PluginContext::current_name`] follows renames.
    pub device_name: String,
    pub coordinator: TransferCoordinator,
    pub config: Arc<CoreConfig>,
}

impl PluginContext {
    /// Send through the owning device. Fails with `Unreachable` if the device is gone.
    pub async fn send_packet(&self, packet: &Packet) -> crate::Result<()> {
        match self.device.upgrade() {
            Some(device) => device.send_packet(packet).await,
            None => Err(crate::Error::Unreachable),
        }
    }

    pub async fn current_name(&self) -> String {
        match self.device.upgrade() {
            Some(device) => device.name().await,
            None => self.device_name.clone(),
        }
    }
}

pub type PluginFactory = Box<dyn Fn(PluginContext) -> Arc<dyn Plugin> + Send + Sync>;

pub struct PluginRegistration {
    pub name: &'static str,
    /// Packet types the plugin receives.
    pub incoming: &'static [&'static str],
    /// Packet types the plugin sends.
    pub outgoing: &'static [&'static str],
    pub factory: PluginFactory,
}

#[derive(Default)]
pub struct PluginTable {
    registrations: Vec<PluginRegistration>,
}

impl PluginTable {
    pub fn new(registrations: Vec<PluginRegistration>) -> Self {
        Self { registrations }
    }

    /// Later registrations with the same name replace earlier ones.
    pub fn register(&mut self, registration: PluginRegistration) {
        self.registrations.retain(|r| r.name != registration.name);
        self.registrations.push(registration);
    }

    pub fn get(&self, name: &str) -> Option<&PluginRegistration> {
        self.registrations.iter().find(|r| r.name == name)
    }

    /// The plugin that receives `packet_type`. First registration wins.
    pub fn handler_for(&self, packet_type: &str) -> Option<&PluginRegistration> {
        self.registrations
            .iter()
            .find(|r| r.incoming.contains(&packet_type))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginRegistration> {
        self.registrations.iter()
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.registrations.iter().map(|r| r.name.to_string()).collect()
    }

    /// Everything we can receive; announced in our identity packet.
    pub fn incoming_capabilities(&self) -> BTreeSet<String> {
        self.registrations
            .iter()
            .flat_map(|r| r.incoming.iter().map(|t| t.to_string()))
            .collect()
    }

    pub fn outgoing_capabilities(&self) -> BTreeSet<String> {
        self.registrations
            .iter()
            .flat_map(|r| r.outgoing.iter().map(|t| t.to_string()))
            .collect()
    }

    /// Plugins usable with a peer announcing these capabilities: the peer sends something we
    /// receive, or receives something we send. A peer that announces nothing supports all.
    pub fn supported_by(
        &self,
        peer_incoming: &BTreeSet<String>,
        peer_outgoing: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        if peer_incoming.is_empty() && peer_outgoing.is_empty() {
            return self.names();
        }
        self.registrations
            .iter()
            .filter(|r| {
                r.incoming.iter().any(|t| peer_outgoing.contains(*t))
                    || r.outgoing.iter().any(|t| peer_incoming.contains(*t))
            })
            .map(|r| r.name.to_string())
            .collect()
    }
}

/// A notification as handed to the desktop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationView {
    /// Unique across devices: `<device id>:<notification id>`.
    pub key: String,
    pub device_name: String,
    pub app_name: String,
    pub text: String,
    pub icon: Option<PathBuf>,
    pub actions: Vec<String>,
    pub replyable: bool,
}

/// Rendering boundary. The daemon logs; a desktop embedder would show real notifications.
pub trait NotificationSink: Send + Sync {
    fn show(&self, view: &NotificationView);
    fn close(&self, key: &str);
}

/// Built-in plugins, rendering through `sink`.
pub fn builtin(sink: Arc<dyn NotificationSink>) -> PluginTable {
    PluginTable::new(vec![
        ping::registration(sink.clone()),
        notifications::registration(sink),
    ])
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;
    use crate::protocol::{PACKET_TYPE_NOTIFICATION, PACKET_TYPE_PING};

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn builtin_table_routes_by_type() {
        let table = builtin(Arc::new(RecordingSink::default()));
        assert_eq!(table.handler_for(PACKET_TYPE_PING).unwrap().name, "ping");
        assert_eq!(
            table.handler_for(PACKET_TYPE_NOTIFICATION).unwrap().name,
            "notifications"
        );
        assert!(table.handler_for("tether.unknown").is_none());
        assert!(table.incoming_capabilities().contains(PACKET_TYPE_NOTIFICATION));
    }

    #[test]
    fn supported_follows_peer_capabilities() {
        let table = builtin(Arc::new(RecordingSink::default()));
        assert_eq!(
            table.supported_by(&set(&[]), &set(&[])),
            set(&["notifications", "ping"])
        );
        assert_eq!(
            table.supported_by(&set(&["tether.ping"]), &set(&["tether.ping"])),
            set(&["ping"])
        );
        assert_eq!(
            table.supported_by(&set(&["tether.notification.request"]), &set(&[])),
            set(&["notifications"])
        );
    }

    #[test]
    fn two_builtin_peers_support_every_plugin() {
        let ours = builtin(Arc::new(RecordingSink::default()));
        let theirs = builtin(Arc::new(RecordingSink::default()));
        assert_eq!(
            ours.supported_by(
                &theirs.incoming_capabilities(),
                &theirs.outgoing_capabilities()
            ),
            set(&["notifications", "ping"])
        );
        assert!(theirs.outgoing_capabilities().contains(PACKET_TYPE_NOTIFICATION));
    }
}
