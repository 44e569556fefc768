//! Console line classification.
//!
//! The server's log format is an external contract that changes between
//! server versions, so recognition is a table of `(kind, regex)` rules tried
//! in order, first match wins. Supporting a new server build means adding a
//! row (either to [`DEFAULT_PATTERNS`] or through `classifier.patterns` in
//! the configuration), never touching the matching code.
//!
//! Named capture groups become payload entries; captures consisting only of
//! ASCII digits are stored as integers.
//!
//! ```
//! use astro_supervisor::classifier::LineClassifier;
//! use astro_supervisor::event::{EventKind, Value};
//!
//! let classifier = LineClassifier::with_defaults();
//! let event = classifier.classify(b"Player 'Foo' joined (1/8)\r\n").unwrap();
//! assert_eq!(event.kind, EventKind::PlayerJoin);
//! assert_eq!(event.get("player"), Some(&Value::from("Foo")));
//! assert_eq!(event.get("count"), Some(&Value::Int(1)));
//! ```

use crate::config::{ClassifierConfig, UnmatchedPolicy};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, Value};
use chrono::{DateTime, Utc};
use regex::Regex;

/// Built-in rules, most specific first.
pub const DEFAULT_PATTERNS: &[(EventKind, &str)] = &[
    (
        EventKind::PlayerJoin,
        r"(?i)player '(?P<player>[^']*)' joined(?: the game)?(?:\s*\((?P<count>\d+)/(?P<max>\d+)\))?",
    ),
    (
        EventKind::PlayerLeave,
        r"(?i)player '(?P<player>[^']*)' left(?: the game)?(?:\s*\((?P<count>\d+)/(?P<max>\d+)\))?",
    ),
    (
        EventKind::SavegameChange,
        r"(?i)save(?:game)? changed to '(?P<savegame>[^']*)'",
    ),
    (EventKind::Save, r"(?i)\b(?:game saved|saving game)\b"),
    (EventKind::Command, r"(?i)command executed:\s*(?P<command>.+?)\s*$"),
    (EventKind::Registered, r"(?i)\b(?:registering server|server registered)\b"),
    (EventKind::Start, r"(?i)\bserver starting\b"),
    (EventKind::Shutdown, r"(?i)\bshutting down\b"),
];

/// A compiled classification rule.
#[derive(Debug, Clone)]
pub struct PatternRule {
    kind: EventKind,
    regex: Regex,
}

impl PatternRule {
    pub fn new(kind: EventKind, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| {
            Error::ConfigInvalid(format!("Invalid pattern for '{}': {}", kind, e))
        })?;
        Ok(Self { kind, regex })
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    fn apply(&self, line: &str, timestamp: DateTime<Utc>) -> Option<Event> {
        let captures = self.regex.captures(line)?;
        let mut event = Event::at(self.kind, timestamp);

        for name in self.regex.capture_names().flatten() {
            if let Some(m) = captures.name(name) {
                let text = m.as_str();
                let value = if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
                    text.parse::<i64>()
                        .map(Value::Int)
                        .unwrap_or_else(|_| Value::from(text))
                } else {
                    Value::from(text)
                };
                event.payload.insert(name.to_string(), value);
            }
        }

        Some(event)
    }
}

/// Stateless mapping from a raw output line to at most one [`Event`].
#[derive(Debug, Clone)]
pub struct LineClassifier {
    rules: Vec<PatternRule>,
    unmatched: UnmatchedPolicy,
}

impl LineClassifier {
    /// Classifier from an explicit ordered rule list.
    pub fn new(rules: Vec<PatternRule>, unmatched: UnmatchedPolicy) -> Self {
        Self { rules, unmatched }
    }

    /// The built-in rules with unmatched lines dropped.
    pub fn with_defaults() -> Self {
        let rules = DEFAULT_PATTERNS
            .iter()
            .filter_map(|(kind, pattern)| PatternRule::new(*kind, pattern).ok())
            .collect();
        Self::new(rules, UnmatchedPolicy::Drop)
    }

    /// Configured rules first, then the built-ins.
    pub fn from_config(config: &ClassifierConfig) -> Result<Self> {
        let mut rules = Vec::with_capacity(config.patterns.len() + DEFAULT_PATTERNS.len());
        for pattern in &config.patterns {
            rules.push(PatternRule::new(pattern.kind, &pattern.regex)?);
        }
        for (kind, pattern) in DEFAULT_PATTERNS {
            rules.push(PatternRule::new(*kind, pattern)?);
        }
        Ok(Self::new(rules, config.unmatched))
    }

    pub fn rules(&self) -> &[PatternRule] {
        &self.rules
    }

    /// Classify a raw line, stamping the event with the current time.
    pub fn classify(&self, raw: &[u8]) -> Option<Event> {
        self.classify_at(raw, Utc::now())
    }

    /// Classify a raw line with an explicit timestamp.
    ///
    /// Never fails: undecodable bytes are replaced, blank lines yield `None`,
    /// and lines no rule matches follow the unmatched policy.
    pub fn classify_at(&self, raw: &[u8], timestamp: DateTime<Utc>) -> Option<Event> {
        self.classify_line(&decode_line(raw), timestamp)
    }

    /// Classify an already decoded line.
    pub fn classify_line(&self, line: &str, timestamp: DateTime<Utc>) -> Option<Event> {
        if line.trim().is_empty() {
            return None;
        }

        if let Some(event) = self.rules.iter().find_map(|rule| rule.apply(line, timestamp)) {
            return Some(event);
        }

        match self.unmatched {
            UnmatchedPolicy::Drop => None,
            UnmatchedPolicy::Message => Some(Event::at(EventKind::Message, timestamp)),
        }
    }
}

impl Default for LineClassifier {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Best-effort decode of one output line: invalid UTF-8 is replaced and the
/// trailing line terminator removed.
pub fn decode_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.trim_end_matches(['\r', '\n']).to_string()
}
