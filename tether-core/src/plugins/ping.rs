//! Ping: the simplest round trip, useful to find a device.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use super::{NotificationSink, NotificationView, Plugin, PluginContext, PluginRegistration};
use crate::device::Device;
use crate::packet::Packet;
use crate::protocol::PACKET_TYPE_PING;

pub const NAME: &str = "ping";

pub struct PingPlugin {
    ctx: PluginContext,
    sink: Arc<dyn NotificationSink>,
}

impl PingPlugin {
    pub fn new(ctx: PluginContext, sink: Arc<dyn NotificationSink>) -> Self {
        Self { ctx, sink }
    }
}

#[async_trait]
impl Plugin for PingPlugin {
    async fn receive_packet(&self, packet: &Packet) -> bool {
        let text = packet
            .get::<String>("message")
            .unwrap_or_else(|| "Ping!".into());
        self.sink.show(&NotificationView {
            key: format!("{}:ping:{}", self.ctx.device_id, packet.id()),
            device_name: self.ctx.current_name().await,
            app_name: "Ping".into(),
            text,
            icon: None,
            actions: Vec::new(),
            replyable: false,
        });
        true
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub fn registration(sink: Arc<dyn NotificationSink>) -> PluginRegistration {
    PluginRegistration {
        name: NAME,
        incoming: &[PACKET_TYPE_PING],
        outgoing: &[PACKET_TYPE_PING],
        factory: Box::new(move |ctx| Arc::new(PingPlugin::new(ctx, sink.clone())) as Arc<dyn Plugin>),
    }
}

/// Ping a device, optionally with a message shown instead of "Ping!".
pub async fn send_ping(device: &Device, message: Option<&str>) -> crate::Result<()> {
    let mut packet = Packet::new(PACKET_TYPE_PING);
    if let Some(message) = message {
        packet = packet.with_field("message", message);
    }
    device.send_packet(&packet).await
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use super::*;
    use crate::config::CoreConfig;
    use crate::identity::Keypair;
    use crate::plugins::testing::RecordingSink;
    use crate::transfer::TransferCoordinator;

    fn plugin(sink: Arc<RecordingSink>) -> PingPlugin {
        PingPlugin::new(
            PluginContext {
                device: Weak::new(),
                device_id: Keypair::generate().device_id(),
                device_name: "Phone1".into(),
                coordinator: TransferCoordinator::new(),
                config: Arc::new(CoreConfig::default()),
            },
            sink,
        )
    }

    #[tokio::test]
    async fn ping_shows_default_or_message() {
        let sink = Arc::new(RecordingSink::default());
        let p = plugin(sink.clone());
        assert!(p.receive_packet(&Packet::new(PACKET_TYPE_PING)).await);
        assert!(
            p.receive_packet(&Packet::new(PACKET_TYPE_PING).with_field("message", "where are you"))
                .await
        );
        let shown = sink.shown();
        assert_eq!(shown.len(), 2);
        assert_eq!(shown[0].text, "Ping!");
        assert_eq!(shown[0].device_name, "Phone1");
        assert_eq!(shown[1].text, "where are you");
    }
}
