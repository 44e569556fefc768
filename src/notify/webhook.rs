use super::format::{log_style, Notification, StyleOverrides, APP_NAME, ICON_URL};
use super::Channel;
use crate::config::NotificationLevel;
use crate::error::Result;
use crate::http::HttpClient;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use url::Url;

/// Message flag that delivers the post without a push notification.
const SUPPRESS_NOTIFICATIONS: u32 = 1 << 12;

/// Chat webhook channel (Discord-compatible embed messages).
pub struct WebhookChannel {
    url: Url,
    name: Option<String>,
    level: NotificationLevel,
    silent: bool,
    overrides: StyleOverrides,
    http: Arc<dyn HttpClient>,
}

impl WebhookChannel {
    pub fn new(url: Url, name: Option<String>, http: Arc<dyn HttpClient>) -> Self {
        Self {
            url,
            name,
            level: NotificationLevel::default(),
            silent: false,
            overrides: StyleOverrides::default(),
            http,
        }
    }

    pub fn with_level(mut self, level: NotificationLevel) -> Self {
        self.level = level;
        self
    }

    /// Post without pinging channel members.
    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn with_overrides(mut self, overrides: StyleOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// JSON body for one notification.
    pub fn body(&self, notification: &Notification) -> serde_json::Value {
        let username = self.name.as_deref().unwrap_or(&notification.server_name);
        let embed = match notification.level {
            Some(level) => {
                let (heading, color, _) = log_style(level);
                json!({
                    "title": heading,
                    "description": notification.text,
                    "color": color,
                    "author": { "name": "Server Message" },
                    "footer": { "text": format!("{} v{}", APP_NAME, env!("CARGO_PKG_VERSION")) },
                    "timestamp": notification.timestamp.to_rfc3339(),
                })
            }
            None => {
                let style = self.overrides.apply(notification.kind, &notification.style);
                json!({
                    "title": format!(":{}: {}", style.emoji, notification.text),
                    "color": style.color,
                    "author": { "name": "Server Notification" },
                    "fields": [
                        { "name": "Event", "value": notification.kind.as_str(), "inline": true },
                    ],
                    "footer": { "text": format!("{} v{}", APP_NAME, env!("CARGO_PKG_VERSION")) },
                    "timestamp": notification.timestamp.to_rfc3339(),
                })
            }
        };

        let mut body = json!({
            "content": null,
            "username": username,
            "avatar_url": ICON_URL,
            "embeds": [embed],
        });
        if self.silent {
            body["flags"] = json!(SUPPRESS_NOTIFICATIONS);
        }
        body
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn label(&self) -> String {
        format!("webhook:{}", self.url.host_str().unwrap_or("?"))
    }

    fn level(&self) -> NotificationLevel {
        self.level
    }

    async fn deliver(&self, notification: &Notification) -> Result<()> {
        let body = self.body(notification);
        self.http.post_json(self.url.as_str(), &body).await
    }
}
