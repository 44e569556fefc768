//! Status snapshot folding and publishing.
//!
//! [`StatusTracker`] rebuilds a [`StatusSnapshot`] purely from the event
//! stream. [`StatusReporter`] runs it as a bus subscriber and sends the
//! snapshot to an external endpoint as a GET with query parameters, whenever
//! the state or player count changed since the last successful publish and
//! otherwise once per heartbeat interval.

use crate::bus::{EventBus, Subscription};
use crate::config::StatusConfig;
use crate::event::{Event, EventKind};
use crate::http::HttpClient;
use crate::server::ServerState;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: ServerState,
    pub player_count: u32,
    pub max_players: u32,
    /// Baseline for uptime; set by `start`, cleared when the server goes down.
    pub started_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub server_name: String,
}

impl StatusSnapshot {
    pub fn new(server_name: impl Into<String>, max_players: u32) -> Self {
        Self {
            state: ServerState::Stopped,
            player_count: 0,
            max_players,
            started_at: None,
            last_event_at: None,
            server_name: server_name.into(),
        }
    }

    pub fn uptime_seconds(&self, now: DateTime<Utc>) -> i64 {
        self.started_at
            .map(|start| (now - start).num_seconds().max(0))
            .unwrap_or(0)
    }

    /// Query parameters sent to the status endpoint.
    pub fn query_pairs(&self, now: DateTime<Utc>) -> Vec<(&'static str, String)> {
        let status = if self.state == ServerState::Running { "up" } else { "down" };
        let mut pairs = vec![
            ("status", status.to_string()),
            ("state", self.state.as_str().to_string()),
            ("players", self.player_count.to_string()),
            ("maxPlayers", self.max_players.to_string()),
            ("uptime", self.uptime_seconds(now).to_string()),
            ("server", self.server_name.clone()),
        ];
        if let Some(at) = self.last_event_at {
            pairs.push(("lastEvent", at.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        pairs
    }

    /// `base` with the snapshot appended as query parameters.
    pub fn to_url(&self, base: &Url, now: DateTime<Utc>) -> Url {
        let mut url = base.clone();
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in self.query_pairs(now) {
                query.append_pair(key, &value);
            }
        }
        url
    }

    fn change_key(&self) -> (ServerState, u32) {
        (self.state, self.player_count)
    }
}

/// Folds events into a [`StatusSnapshot`].
#[derive(Debug, Clone)]
pub struct StatusTracker {
    snapshot: StatusSnapshot,
}

impl StatusTracker {
    pub fn new(server_name: impl Into<String>, max_players: u32) -> Self {
        Self {
            snapshot: StatusSnapshot::new(server_name, max_players),
        }
    }

    pub fn snapshot(&self) -> &StatusSnapshot {
        &self.snapshot
    }

    /// Apply one event. The player count only moves on join/leave events and
    /// is reset by `start`, never going below zero.
    pub fn apply(&mut self, event: &Event) {
        let snapshot = &mut self.snapshot;
        snapshot.last_event_at = Some(event.timestamp);

        match event.kind {
            EventKind::Start => {
                snapshot.state = ServerState::WaitingRegistration;
                snapshot.player_count = 0;
                snapshot.started_at = Some(event.timestamp);
            }
            EventKind::Registered => snapshot.state = ServerState::Running,
            EventKind::Shutdown => {
                snapshot.state = ServerState::Stopped;
                snapshot.started_at = None;
            }
            EventKind::Crash => {
                snapshot.state = ServerState::Crashed;
                snapshot.started_at = None;
            }
            EventKind::PlayerJoin => {
                snapshot.player_count = snapshot.player_count.saturating_add(1);
                self.update_max(event);
            }
            EventKind::PlayerLeave => {
                snapshot.player_count = snapshot.player_count.saturating_sub(1);
                self.update_max(event);
            }
            _ => {}
        }
    }

    fn update_max(&mut self, event: &Event) {
        if let Some(max) = event
            .get("max")
            .and_then(|v| v.as_i64())
            .and_then(|v| u32::try_from(v).ok())
        {
            self.snapshot.max_players = max;
        }
    }
}

/// Bus subscriber publishing the snapshot to the status endpoint.
pub struct StatusReporter {
    config: StatusConfig,
    http: Arc<dyn HttpClient>,
    tracker: StatusTracker,
    last_published: Option<(ServerState, u32)>,
}

impl StatusReporter {
    pub fn new(config: StatusConfig, tracker: StatusTracker, http: Arc<dyn HttpClient>) -> Self {
        Self {
            config,
            http,
            tracker,
            last_published: None,
        }
    }

    /// Subscribe to `bus` and run in a new task. The task ends when the bus
    /// is gone and returns the final snapshot.
    pub fn spawn(self, bus: &EventBus) -> JoinHandle<StatusSnapshot> {
        let subscription = bus.subscribe("status");
        tokio::spawn(self.run(subscription))
    }

    #[tracing::instrument(skip_all, fields(url = %self.config.url))]
    pub async fn run(mut self, mut subscription: Subscription) -> StatusSnapshot {
        let mut heartbeat = tokio::time::interval(self.config.interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = subscription.recv() => match event {
                    Some(event) => {
                        self.tracker.apply(&event);
                        if self.last_published != Some(self.tracker.snapshot().change_key()) {
                            self.publish().await;
                            heartbeat.reset();
                        }
                    }
                    None => break,
                },
                _ = heartbeat.tick() => {
                    self.publish().await;
                }
            }
        }

        tracing::debug!(dropped = subscription.dropped(), "Status reporter stopped");
        self.tracker.snapshot
    }

    /// Send the current snapshot once. Failures are logged; the next change
    /// or heartbeat tries again with a fresh snapshot.
    async fn publish(&mut self) {
        let snapshot = self.tracker.snapshot();
        let url = snapshot.to_url(&self.config.url, Utc::now());

        match self.http.get(url.as_str()).await {
            Ok(_) => {
                tracing::debug!(state = %snapshot.state, players = snapshot.player_count, "Status published");
                self.last_published = Some(snapshot.change_key());
            }
            Err(e) => tracing::warn!(error = %e, "Failed to publish status"),
        }
    }
}
