//! Mirrors the peer's notifications on this desktop.
//!
//! Icons travel as packet payloads and are cached under the icon cache directory, one file per
//! payload hash. Several notifications of one app share an icon, so the fetch goes through the
//! transfer coordinator and only one download per hash runs at a time. A failed download never
//! drops the notification; it is shown without an icon.

use std::any::Any;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{NotificationSink, NotificationView, Plugin, PluginContext, PluginRegistration};
use crate::packet::{Packet, Payload};
use crate::protocol::{
    PACKET_TYPE_NOTIFICATION, PACKET_TYPE_NOTIFICATION_ACTION, PACKET_TYPE_NOTIFICATION_REPLY,
    PACKET_TYPE_NOTIFICATION_REQUEST,
};

pub const NAME: &str = "notifications";

const REPLY_ACTION: &str = "Reply";

/// One notification as posted by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: String,
    pub app_name: String,
    pub ticker: String,
    pub title: String,
    pub text: String,
    /// The peer allows dismissing it from here.
    pub dismissable: bool,
    pub silent: bool,
    pub payload_hash: Option<String>,
    /// Present when the notification accepts an inline reply.
    pub request_reply_id: Option<String>,
    pub actions: Vec<String>,
    /// Cached icon, once fetched.
    pub icon: Option<PathBuf>,
}

impl Notification {
    /// `None` if the packet carries no id.
    pub fn from_packet(packet: &Packet) -> Option<Self> {
        let id = packet.get::<String>("id")?;
        let string = |key: &str| packet.get_or(key, String::new());
        Some(Self {
            id,
            app_name: string("appName"),
            ticker: string("ticker"),
            title: string("title"),
            text: string("text"),
            dismissable: packet.get_or("isClearable", false),
            silent: packet.get_or("silent", false),
            payload_hash: packet
                .get::<String>("payloadHash")
                .filter(|h| !h.is_empty()),
            request_reply_id: packet
                .get::<String>("requestReplyId")
                .filter(|r| !r.is_empty()),
            actions: packet.get_or("actions", Vec::new()),
            icon: None,
        })
    }

    /// Body text shown under the app name.
    pub fn display_text(&self) -> String {
        if self.title.is_empty() && self.text.is_empty() {
            self.ticker.clone()
        } else if self.title.is_empty() || self.title == self.app_name {
            self.text.clone()
        } else if self.text.is_empty() {
            self.title.clone()
        } else {
            format!("{}: {}", self.title, self.text)
        }
    }

    pub fn is_replyable(&self) -> bool {
        self.request_reply_id.is_some()
    }
}

/// Payload hashes name files in the cache directory; anything that is not a plain name is refused.
fn is_safe_file_name(hash: &str) -> bool {
    !hash.is_empty()
        && hash
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(unix)]
async fn prepare_cache_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await
}

#[cfg(not(unix))]
async fn prepare_cache_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await
}

struct Shared {
    ctx: PluginContext,
    sink: Arc<dyn NotificationSink>,
    active: Mutex<BTreeMap<String, Notification>>,
}

impl Shared {
    fn key(&self, id: &str) -> String {
        format!("{}:{}", self.ctx.device_id, id)
    }

    async fn view(&self, n: &Notification) -> NotificationView {
        let mut actions = n.actions.clone();
        if n.is_replyable() {
            actions.insert(0, REPLY_ACTION.to_string());
        }
        NotificationView {
            key: self.key(&n.id),
            device_name: self.ctx.current_name().await,
            app_name: n.app_name.clone(),
            text: n.display_text(),
            icon: n.icon.clone(),
            actions,
            replyable: n.is_replyable(),
        }
    }

    async fn post(&self, notification: Notification) {
        let view = self.view(&notification).await;
        let silent = notification.silent;
        self.active
            .lock()
            .await
            .insert(notification.id.clone(), notification);
        if !silent {
            self.sink.show(&view);
        }
    }

    /// Show `pending` with its icon, unless it was cancelled or replaced while the icon loaded.
    async fn settle(&self, pending: Notification, icon: Option<PathBuf>) {
        let mut active = self.active.lock().await;
        let notification = match active.get_mut(&pending.id) {
            Some(current) if *current == pending => {
                current.icon = icon;
                current.clone()
            }
            _ => {
                debug!(device = %self.ctx.device_id, id = %pending.id, "notification changed while its icon loaded");
                return;
            }
        };
        drop(active);
        if !notification.silent {
            self.sink.show(&self.view(&notification).await);
        }
    }

    async fn fetch_icon(&self, payload: Arc<Payload>, hash: &str) -> Option<PathBuf> {
        if !is_safe_file_name(hash) {
            warn!(device = %self.ctx.device_id, hash, "refusing icon with unsafe payload hash");
            return None;
        }
        let dir = &self.ctx.config.icon_cache_dir;
        if let Err(e) = prepare_cache_dir(dir).await {
            warn!(dir = %dir.display(), error = %e, "icon cache unavailable");
            return None;
        }
        match self.ctx.coordinator.fetch(dir.join(hash), payload).await {
            Ok(path) => Some(path),
            Err(e) => {
                debug!(device = %self.ctx.device_id, hash, error = %e, "icon fetch failed, showing without icon");
                None
            }
        }
    }
}

/// Icons download in the background; a notification with an icon is shown once its download
/// settles, so a slow payload never holds up the packets behind it.
pub struct NotificationsPlugin {
    shared: Arc<Shared>,
    unloaded: CancellationToken,
}

impl NotificationsPlugin {
    pub fn new(ctx: PluginContext, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                ctx,
                sink,
                active: Mutex::new(BTreeMap::new()),
            }),
            unloaded: CancellationToken::new(),
        }
    }

    /// Notifications currently shown, by id.
    pub async fn active(&self) -> Vec<Notification> {
        self.shared.active.lock().await.values().cloned().collect()
    }

    /// Ask the peer to dismiss a notification. Returns false if it is unknown or not dismissable.
    pub async fn dismiss(&self, id: &str) -> crate::Result<bool> {
        let dismissable = self
            .shared
            .active
            .lock()
            .await
            .get(id)
            .is_some_and(|n| n.dismissable);
        if !dismissable {
            return Ok(false);
        }
        self.shared
            .ctx
            .send_packet(&Packet::new(PACKET_TYPE_NOTIFICATION_REQUEST).with_field("cancel", id))
            .await?;
        if self.shared.active.lock().await.remove(id).is_some() {
            self.shared.sink.close(&self.shared.key(id));
        }
        Ok(true)
    }

    pub async fn trigger_action(&self, id: &str, action: &str) -> crate::Result<()> {
        self.shared
            .ctx
            .send_packet(
                &Packet::new(PACKET_TYPE_NOTIFICATION_ACTION)
                    .with_field("key", id)
                    .with_field("action", action),
            )
            .await
    }

    pub async fn reply(&self, request_reply_id: &str, message: &str) -> crate::Result<()> {
        self.shared
            .ctx
            .send_packet(
                &Packet::new(PACKET_TYPE_NOTIFICATION_REPLY)
                    .with_field("requestReplyId", request_reply_id)
                    .with_field("message", message),
            )
            .await
    }
}

impl Drop for NotificationsPlugin {
    fn drop(&mut self) {
        self.unloaded.cancel();
    }
}

#[async_trait]
impl Plugin for NotificationsPlugin {
    async fn receive_packet(&self, packet: &Packet) -> bool {
        let Some(id) = packet.get::<String>("id") else {
            return false;
        };
        if packet.get_or("isCancel", false) {
            if self.shared.active.lock().await.remove(&id).is_some() {
                self.shared.sink.close(&self.shared.key(&id));
            }
            return true;
        }
        let Some(notification) = Notification::from_packet(packet) else {
            return false;
        };
        let (Some(hash), Some(payload)) = (notification.payload_hash.clone(), packet.payload())
        else {
            self.shared.post(notification).await;
            return true;
        };
        self.shared
            .active
            .lock()
            .await
            .insert(id, notification.clone());
        let shared = Arc::clone(&self.shared);
        let payload = Arc::clone(payload);
        let unloaded = self.unloaded.clone();
        tokio::spawn(async move {
            let icon = tokio::select! {
                _ = unloaded.cancelled() => return,
                icon = shared.fetch_icon(payload, &hash) => icon,
            };
            shared.settle(notification, icon).await;
        });
        true
    }

    /// Ask the peer for the notifications it already has.
    async fn connected(&self) {
        let request = Packet::new(PACKET_TYPE_NOTIFICATION_REQUEST).with_field("request", true);
        if let Err(e) = self.shared.ctx.send_packet(&request).await {
            debug!(device = %self.shared.ctx.device_id, error = %e, "could not request notifications");
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub fn registration(sink: Arc<dyn NotificationSink>) -> PluginRegistration {
    PluginRegistration {
        name: NAME,
        incoming: &[PACKET_TYPE_NOTIFICATION],
        outgoing: &[
            PACKET_TYPE_NOTIFICATION,
            PACKET_TYPE_NOTIFICATION_REQUEST,
            PACKET_TYPE_NOTIFICATION_ACTION,
            PACKET_TYPE_NOTIFICATION_REPLY,
        ],
        factory: Box::new(move |ctx| {
            Arc::new(NotificationsPlugin::new(ctx, sink.clone())) as Arc<dyn Plugin>
        }),
    }
}
