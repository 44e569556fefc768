use crate::config::{HexColor, PushPriority};
use crate::event::{Event, EventKind, Payload};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// App name used as sender name, tag and footer.
pub const APP_NAME: &str = "AstroSupervisor";

pub const ICON_URL: &str = "https://astroneer.wiki.gg/images/7/74/Icon_Astroneer.png";

/// Default message template for an event kind.
///
/// `{field}` placeholders are filled from the event payload; `{name}` is
/// the server display name.
pub fn template(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Message => "{message}",
        EventKind::Start => "Server started!",
        EventKind::Registered => "Server registered with Playfab!",
        EventKind::Shutdown => "Server shutting down...",
        EventKind::Crash => "Server crashed!",
        EventKind::PlayerJoin => "Player '{player}' joined the game",
        EventKind::PlayerLeave => "Player '{player}' left the game",
        EventKind::Command => "Command executed: {command}",
        EventKind::Save => "Game saved!",
        EventKind::SavegameChange => "Savegame changed to '{savegame}'",
        EventKind::NetworkWarning => "Network warning: {message}",
    }
}

/// Per-kind presentation shared by all channel kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Style {
    /// Embed colour as `0xRRGGBB`
    pub color: u32,
    /// Emoji short code without colons
    pub emoji: String,
    /// Push priority, 1 (min) to 5 (max)
    pub priority: u8,
}

pub fn style(kind: EventKind) -> Style {
    let (color, emoji, priority) = match kind {
        EventKind::Message => (10526880, "information_source", 2),
        EventKind::Start => (3256064, "green_square", 4),
        EventKind::Registered => (10526880, "white_check_mark", 3),
        EventKind::Shutdown => (14440960, "orange_square", 4),
        EventKind::Crash => (13764616, "red_square", 5),
        EventKind::PlayerJoin => (41160, "inbox_tray", 3),
        EventKind::PlayerLeave => (6553800, "outbox_tray", 3),
        EventKind::Command => (15118080, "wrench", 3),
        EventKind::Save => (7274240, "file_cabinet", 2),
        EventKind::SavegameChange => (15118080, "card_index_dividers", 2),
        EventKind::NetworkWarning => (16750848, "warning", 4),
    };
    Style {
        color,
        emoji: emoji.to_string(),
        priority,
    }
}

/// Per-channel replacements for parts of [`style`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StyleOverrides {
    pub emojis: BTreeMap<EventKind, String>,
    pub colors: BTreeMap<EventKind, HexColor>,
    pub priorities: BTreeMap<EventKind, PushPriority>,
}

impl StyleOverrides {
    /// `base` with this channel's entries for `kind` applied.
    pub fn apply(&self, kind: EventKind, base: &Style) -> Style {
        let mut style = base.clone();
        if let Some(emoji) = self.emojis.get(&kind) {
            style.emoji = emoji.trim_matches(':').to_string();
        }
        if let Some(color) = self.colors.get(&kind) {
            style.color = color.0;
        }
        if let Some(priority) = self.priorities.get(&kind) {
            style.priority = priority.as_u8();
        }
        style
    }
}

/// Heading, embed colour and push priority for a forwarded log record.
pub fn log_style(level: tracing::Level) -> (&'static str, u32, u8) {
    match level {
        tracing::Level::ERROR => ("Error", 0xff0000, 5),
        tracing::Level::WARN => ("Warning", 0xff8500, 4),
        tracing::Level::INFO => ("Information", 0x777777, 3),
        tracing::Level::DEBUG => ("Debug", 0x3c475e, 2),
        _ => ("Trace", 0x2b2d31, 1),
    }
}

/// Fill `{key}` placeholders from `payload`, with `{name}` mapped to
/// `server_name` unless the payload has its own `name`.
///
/// Placeholders without a value are left untouched.
pub fn render(template: &str, payload: &Payload, server_name: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };

        let key = &after[..close];
        match payload.get(key) {
            Some(value) => out.push_str(&value.to_string()),
            None if key == "name" => out.push_str(server_name),
            None => {
                out.push('{');
                out.push_str(key);
                out.push('}');
            }
        }
        rest = &after[close + 1..];
    }

    out.push_str(rest);
    out
}

/// An event rendered once and handed to every channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kind: EventKind,
    pub text: String,
    pub server_name: String,
    pub timestamp: DateTime<Utc>,
    pub style: Style,
    /// Set when the notification is a forwarded log record
    pub level: Option<tracing::Level>,
}

impl Notification {
    pub fn from_event(event: &Event, server_name: &str) -> Self {
        Self {
            kind: event.kind,
            text: render(template(event.kind), &event.payload, server_name),
            server_name: server_name.to_string(),
            timestamp: event.timestamp,
            style: style(event.kind),
            level: event.log_level(),
        }
    }
}
