//! Typed events produced from the server's console output and from the
//! supervisor's own lifecycle decisions.
//!
//! An [`Event`] is a kind, a UTC timestamp and a flat payload of primitive
//! values. Payload keys used by the built-in producers:
//!
//! | kind               | keys                                         |
//! |--------------------|----------------------------------------------|
//! | `player_join/leave`| `player`, `count`, `max`                     |
//! | `shutdown`         | `forced`, `exit_code`                        |
//! | `crash`            | `reason`, `exit_code`, `state`               |
//! | `savegame_change`  | `savegame`                                   |
//! | `command`          | `command`                                    |
//! | `network_warning`  | `check`, `message`, plus check-specific keys |
//! | `message`          | `message` (absent for unmatched lines), plus |
//! |                    | `level` when forwarded from the log          |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Start,
    Registered,
    Shutdown,
    Crash,
    PlayerJoin,
    PlayerLeave,
    Command,
    Save,
    SavegameChange,
    NetworkWarning,
}

impl EventKind {
    /// Every kind, in declaration order.
    pub const ALL: [EventKind; 11] = [
        EventKind::Message,
        EventKind::Start,
        EventKind::Registered,
        EventKind::Shutdown,
        EventKind::Crash,
        EventKind::PlayerJoin,
        EventKind::PlayerLeave,
        EventKind::Command,
        EventKind::Save,
        EventKind::SavegameChange,
        EventKind::NetworkWarning,
    ];

    /// The wire name of the kind (`player_join`, `network_warning`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::Start => "start",
            EventKind::Registered => "registered",
            EventKind::Shutdown => "shutdown",
            EventKind::Crash => "crash",
            EventKind::PlayerJoin => "player_join",
            EventKind::PlayerLeave => "player_leave",
            EventKind::Command => "command",
            EventKind::Save => "save",
            EventKind::SavegameChange => "savegame_change",
            EventKind::NetworkWarning => "network_warning",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event kind '{}'", s))
    }
}

/// A primitive payload value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

/// Event payload: string keys to primitive values, ordered for stable output.
pub type Payload = BTreeMap<String, Value>;

/// A classified or synthetic event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Payload,
}

impl Event {
    /// Create an event of `kind` stamped with the current time.
    pub fn new(kind: EventKind) -> Self {
        Self::at(kind, Utc::now())
    }

    /// Create an event of `kind` with an explicit timestamp.
    pub fn at(kind: EventKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            timestamp,
            payload: Payload::new(),
        }
    }

    /// Builder-style payload insertion.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Plain informational event carrying a `message` field.
    pub fn message(text: impl Into<String>) -> Self {
        Self::new(EventKind::Message).with("message", text.into())
    }

    /// A supervisor log record forwarded to notification channels.
    pub fn log(level: tracing::Level, text: impl Into<String>) -> Self {
        Self::message(text).with("level", level.as_str().to_ascii_lowercase())
    }

    /// Level of a forwarded log record, `None` for every other event.
    pub fn log_level(&self) -> Option<tracing::Level> {
        if self.kind != EventKind::Message {
            return None;
        }
        self.get("level")?.as_str()?.parse().ok()
    }
}

/// Keeps the timestamps handed out by one event source non-decreasing.
///
/// Wall clocks may step backwards; every stamped event is clamped to the
/// latest timestamp this clock has seen.
#[derive(Debug, Default)]
pub struct EventClock {
    last: Option<DateTime<Utc>>,
}

impl EventClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clamp `event.timestamp` so it is not earlier than the previous one.
    pub fn stamp(&mut self, mut event: Event) -> Event {
        if let Some(last) = self.last {
            if event.timestamp < last {
                event.timestamp = last;
            }
        }
        self.last = Some(event.timestamp);
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_kind_round_trips_through_its_name() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!("player_kick".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_kind_serde_uses_snake_case() {
        let json = serde_json::to_string(&EventKind::SavegameChange).unwrap();
        assert_eq!(json, "\"savegame_change\"");
    }

    #[test]
    fn test_clock_never_goes_backwards() {
        let mut clock = EventClock::new();
        let now = Utc::now();

        let first = clock.stamp(Event::at(EventKind::Start, now));
        let second = clock.stamp(Event::at(EventKind::Registered, now - Duration::seconds(5)));
        let third = clock.stamp(Event::at(EventKind::Save, now + Duration::seconds(1)));

        assert_eq!(first.timestamp, now);
        assert_eq!(second.timestamp, now);
        assert_eq!(third.timestamp, now + Duration::seconds(1));
    }

    #[test]
    fn test_payload_builder() {
        let event = Event::new(EventKind::PlayerJoin)
            .with("player", "Foo")
            .with("count", 1)
            .with("forced", false);

        assert_eq!(event.get("player").and_then(Value::as_str), Some("Foo"));
        assert_eq!(event.get("count").and_then(Value::as_i64), Some(1));
        assert_eq!(event.get("forced").and_then(Value::as_bool), Some(false));
    }

    #[test]
    fn test_log_records_carry_their_level() {
        let event = Event::log(tracing::Level::WARN, "disk almost full");
        assert_eq!(event.kind, EventKind::Message);
        assert_eq!(event.get("level").and_then(Value::as_str), Some("warn"));
        assert_eq!(event.log_level(), Some(tracing::Level::WARN));

        assert_eq!(Event::message("Unknown line").log_level(), None);
        assert_eq!(Event::new(EventKind::Save).with("level", "error").log_level(), None);
    }
}
