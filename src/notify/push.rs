use super::format::{log_style, Notification, StyleOverrides, APP_NAME};
use super::Channel;
use crate::config::NotificationLevel;
use crate::error::Result;
use crate::http::HttpClient;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use url::Url;

/// Topic-based push channel (ntfy JSON publishing).
///
/// The message is posted to the server root with the topic in the body.
pub struct PushChannel {
    server_url: Url,
    topic: String,
    name: Option<String>,
    level: NotificationLevel,
    overrides: StyleOverrides,
    http: Arc<dyn HttpClient>,
}

impl PushChannel {
    pub fn new(server_url: Url, topic: String, name: Option<String>, http: Arc<dyn HttpClient>) -> Self {
        Self {
            server_url,
            topic,
            name,
            level: NotificationLevel::default(),
            overrides: StyleOverrides::default(),
            http,
        }
    }

    pub fn with_level(mut self, level: NotificationLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_overrides(mut self, overrides: StyleOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn body(&self, notification: &Notification) -> serde_json::Value {
        let server_name = self.name.as_deref().unwrap_or(&notification.server_name);
        if let Some(level) = notification.level {
            let (heading, _, priority) = log_style(level);
            return json!({
                "topic": self.topic,
                "title": heading,
                "message": notification.text,
                "tags": [APP_NAME, level.as_str().to_ascii_lowercase()],
                "priority": priority,
            });
        }

        let style = self.overrides.apply(notification.kind, &notification.style);
        json!({
            "topic": self.topic,
            "title": notification.text,
            "message": server_name,
            "tags": [style.emoji, notification.kind.as_str(), APP_NAME],
            "priority": style.priority,
        })
    }
}

#[async_trait]
impl Channel for PushChannel {
    fn label(&self) -> String {
        format!("push:{}", self.topic)
    }

    fn level(&self) -> NotificationLevel {
        self.level
    }

    async fn deliver(&self, notification: &Notification) -> Result<()> {
        let body = self.body(notification);
        self.http.post_json(self.server_url.as_str(), &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PushPriority;
    use crate::event::{Event, EventKind};
    use crate::http::UreqClient;

    fn channel() -> PushChannel {
        let server = Url::parse("https://ntfy.sh").unwrap();
        PushChannel::new(server, "astro".to_string(), None, Arc::new(UreqClient::new()))
    }

    #[test]
    fn test_push_body() {
        let event = Event::new(EventKind::PlayerLeave).with("player", "Foo");
        let notification = Notification::from_event(&event, "My Server");
        let body = channel().body(&notification);

        assert_eq!(body["topic"], "astro");
        assert_eq!(body["title"], "Player 'Foo' left the game");
        assert_eq!(body["message"], "My Server");
        assert_eq!(body["priority"], 3);
        assert_eq!(body["tags"][0], "outbox_tray");
        assert_eq!(body["tags"][1], "player_leave");
    }

    #[test]
    fn test_configured_priority_and_emoji_win() {
        let mut overrides = StyleOverrides::default();
        overrides.priorities.insert(EventKind::PlayerLeave, PushPriority::Min);
        overrides.emojis.insert(EventKind::PlayerLeave, "wave".to_string());
        let channel = channel().with_overrides(overrides);

        let event = Event::new(EventKind::PlayerLeave).with("player", "Foo");
        let body = channel.body(&Notification::from_event(&event, "My Server"));
        assert_eq!(body["priority"], 1);
        assert_eq!(body["tags"][0], "wave");
    }

    #[test]
    fn test_log_record_body() {
        let event = Event::log(tracing::Level::ERROR, "Updater failed");
        let body = channel().body(&Notification::from_event(&event, "My Server"));

        assert_eq!(body["title"], "Error");
        assert_eq!(body["message"], "Updater failed");
        assert_eq!(body["priority"], 5);
        assert_eq!(body["tags"][1], "error");
    }
}
