//! Headless notification sink: everything the plugins would show goes to the log.

use tether_core::{NotificationSink, NotificationView};
use tracing::info;

pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn show(&self, view: &NotificationView) {
        info!(
            key = %view.key,
            device = %view.device_name,
            app = %view.app_name,
            icon = ?view.icon,
            actions = ?view.actions,
            replyable = view.replyable,
            "{}",
            view.text
        );
    }

    fn close(&self, key: &str) {
        info!(key, "notification closed");
    }
}
