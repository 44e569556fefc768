//! Forwarding of the supervisor's own log records to notification channels.
//!
//! [`LogForwarder::layer`] is a `tracing_subscriber` layer that turns every
//! record at or above the configured level into an [`Event::log`] on the
//! attached bus. Channels then pick the records their
//! [`NotificationLevel`](crate::config::NotificationLevel) admits.
//!
//! Records are not forwarded when they come from the delivery path itself
//! (`notify`, `bus`, `http`), from raw server or updater output, or when they
//! carry a `skip_notify` field because a dedicated event already covers them.
//!
//! ```no_run
//! use astro_supervisor::logging::LogForwarder;
//! use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
//!
//! let forwarder = LogForwarder::new(Some(tracing::Level::WARN));
//! tracing_subscriber::registry()
//!     .with(tracing_subscriber::fmt::layer())
//!     .with(forwarder.layer())
//!     .init();
//! ```

use crate::bus::EventBus;
use crate::config::Config;
use crate::event::Event;
use std::fmt::{self, Write as _};
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

const SKIPPED_TARGETS: [&str; 5] = [
    "astro_supervisor::notify",
    "astro_supervisor::bus",
    "astro_supervisor::http",
    "server_output",
    "installer",
];

/// Marker field for records that must not be forwarded.
pub const SKIP_FIELD: &str = "skip_notify";

struct Shared {
    max_level: Option<Level>,
    bus: Mutex<Option<EventBus>>,
}

/// Handle shared between the logging setup and the [`Launcher`](crate::Launcher).
#[derive(Clone)]
pub struct LogForwarder {
    shared: Arc<Shared>,
}

impl LogForwarder {
    /// Forward records up to `max_level`; `None` forwards nothing.
    pub fn new(max_level: Option<Level>) -> Self {
        Self {
            shared: Arc::new(Shared {
                max_level,
                bus: Mutex::new(None),
            }),
        }
    }

    /// Threshold from the most verbose channel level in `config`.
    pub fn from_config(config: &Config) -> Self {
        let max_level = config
            .notifications
            .channels
            .iter()
            .filter_map(|channel| channel.level().max_level())
            .max();
        Self::new(max_level)
    }

    pub fn max_level(&self) -> Option<Level> {
        self.shared.max_level
    }

    /// Start publishing to `bus`.
    pub fn attach(&self, bus: EventBus) {
        if let Ok(mut slot) = self.shared.bus.lock() {
            *slot = Some(bus);
        }
    }

    /// Stop publishing and release the bus, so subscribers can see the end of
    /// the stream.
    pub fn detach(&self) {
        if let Ok(mut slot) = self.shared.bus.lock() {
            *slot = None;
        }
    }

    pub fn layer(&self) -> LogForwardLayer {
        LogForwardLayer {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// The layer returned by [`LogForwarder::layer`].
pub struct LogForwardLayer {
    shared: Arc<Shared>,
}

impl<S: Subscriber> Layer<S> for LogForwardLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = *metadata.level();
        match self.shared.max_level {
            Some(max) if level <= max => {}
            _ => return,
        }
        if SKIPPED_TARGETS.iter().any(|target| metadata.target().starts_with(target)) {
            return;
        }

        let mut record = RecordText::default();
        event.record(&mut record);
        if record.skip || record.message.is_empty() {
            return;
        }

        // Publishing logs too; the lock must not be held across it.
        let bus = match self.shared.bus.lock() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        if let Some(bus) = bus {
            bus.publish(Event::log(level, record.finish()));
        }
    }
}

#[derive(Default)]
struct RecordText {
    message: String,
    fields: String,
    skip: bool,
}

impl RecordText {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} ({})", self.message, self.fields)
        }
    }

    fn push_field(&mut self, name: &str, value: fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push_str(", ");
        }
        let _ = write!(self.fields, "{}={}", name, value);
    }
}

impl Visit for RecordText {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            name => self.push_field(name, format_args!("{}", value)),
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        match field.name() {
            SKIP_FIELD => self.skip = value,
            name => self.push_field(name, format_args!("{}", value)),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{:?}", value),
            SKIP_FIELD => self.skip = true,
            name => self.push_field(name, format_args!("{:?}", value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, Value};
    use tracing_subscriber::layer::SubscriberExt;

    async fn forwarded(max_level: Option<Level>, emit: impl FnOnce()) -> Vec<Event> {
        let bus = EventBus::new(16);
        let mut subscription = bus.subscribe("test");
        let forwarder = LogForwarder::new(max_level);
        forwarder.attach(bus);

        let subscriber = tracing_subscriber::registry().with(forwarder.layer());
        tracing::subscriber::with_default(subscriber, emit);

        forwarder.detach();
        let mut events = Vec::new();
        while let Some(event) = subscription.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_records_at_or_above_level_are_forwarded() {
        let events = forwarded(Some(Level::WARN), || {
            tracing::error!(error = "exit status 1", "Updater failed");
            tracing::warn!("Public IP lookup failed");
            tracing::info!("Server process spawned");
            tracing::debug!("Polling");
        })
        .await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Message);
        assert_eq!(events[0].log_level(), Some(Level::ERROR));
        assert_eq!(
            events[0].get("message").and_then(Value::as_str),
            Some("Updater failed (error=exit status 1)")
        );
        assert_eq!(events[1].log_level(), Some(Level::WARN));
    }

    #[tokio::test]
    async fn test_delivery_path_and_marked_records_are_skipped() {
        let events = forwarded(Some(Level::INFO), || {
            tracing::warn!(target: "astro_supervisor::notify", "Giving up on notification");
            tracing::warn!(target: "server_output", "Some console line");
            tracing::error!(skip_notify = true, "Server crashed");
            tracing::info!("Server started");
        })
        .await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get("message").and_then(Value::as_str), Some("Server started"));
    }

    #[tokio::test]
    async fn test_nothing_forwarded_without_level_or_bus() {
        assert!(forwarded(None, || tracing::error!("Updater failed")).await.is_empty());

        let forwarder = LogForwarder::new(Some(Level::ERROR));
        let subscriber = tracing_subscriber::registry().with(forwarder.layer());
        tracing::subscriber::with_default(subscriber, || tracing::error!("No bus yet"));
    }

    #[test]
    fn test_threshold_is_most_verbose_channel() {
        let config = Config::parse_from_str(
            r#"{
                "server": { "executable": "AstroServer.exe" },
                "notifications": {
                    "channels": [
                        { "kind": "webhook", "url": "https://example.com/a", "level": "error" },
                        { "kind": "push", "topic": "astro", "level": "info" },
                        { "kind": "webhook", "url": "https://example.com/b" }
                    ]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(LogForwarder::from_config(&config).max_level(), Some(Level::INFO));

        let quiet = Config::parse_from_str(r#"{ "server": { "executable": "AstroServer.exe" } }"#).unwrap();
        assert_eq!(LogForwarder::from_config(&quiet).max_level(), None);
    }
}
