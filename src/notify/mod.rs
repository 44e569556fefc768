//! Notification dispatch.
//!
//! Whitelisted events are rendered into a [`Notification`] and delivered to
//! every configured channel. Forwarded log records skip the whitelist and go
//! to the channels whose [`NotificationLevel`] admits them. Each channel runs as its own task with its own
//! bus subscription, so a slow or failing endpoint only ever delays (or
//! loses) its own messages. Failed deliveries are retried with bounded
//! backoff and then dropped with a warning; nothing here can affect the
//! server.
//!
//! # Examples
//!
//! ```no_run
//! use astro_supervisor::bus::EventBus;
//! use astro_supervisor::config::Config;
//! use astro_supervisor::http::UreqClient;
//! use astro_supervisor::notify::NotificationDispatcher;
//! use std::sync::Arc;
//!
//! # async fn run() -> astro_supervisor::Result<()> {
//! let config = Config::from_file("config.json")?;
//! let bus = EventBus::new(config.supervisor.event_queue_capacity);
//! let dispatcher = NotificationDispatcher::from_config(&config, Arc::new(UreqClient::new()));
//! let running = dispatcher.spawn(&bus);
//!
//! // ... publish events ...
//!
//! drop(bus);
//! let stats = running.join().await;
//! println!("{} delivered, {} dropped", stats.delivered, stats.failed);
//! # Ok(())
//! # }
//! ```

mod format;
mod push;
mod retry;
mod webhook;

pub use format::{log_style, render, style, template, Notification, Style, StyleOverrides, APP_NAME};
pub use push::PushChannel;
pub use retry::{RetryPolicy, RetryState};
pub use webhook::WebhookChannel;

use crate::bus::{EventBus, Subscription};
use crate::config::{ChannelConfig, Config, NotificationLevel};
use crate::error::Result;
use crate::event::EventKind;
use crate::http::HttpClient;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A delivery backend.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Short label for logs.
    fn label(&self) -> String;

    /// Log records this channel receives.
    fn level(&self) -> NotificationLevel {
        NotificationLevel::Server
    }

    /// Attempt one delivery.
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// Delivery counters for one or more channel tasks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: u64,
    /// Notifications dropped after exhausting their retries
    pub failed: u64,
    /// Events lost to bus backpressure
    pub lagged: u64,
}

impl std::ops::AddAssign for DeliveryStats {
    fn add_assign(&mut self, other: Self) {
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.lagged += other.lagged;
    }
}

/// Builds one task per channel.
pub struct NotificationDispatcher {
    channels: Vec<Arc<dyn Channel>>,
    whitelist: BTreeSet<EventKind>,
    retry: RetryPolicy,
    server_name: String,
}

impl NotificationDispatcher {
    pub fn new(
        channels: Vec<Arc<dyn Channel>>,
        whitelist: BTreeSet<EventKind>,
        retry: RetryPolicy,
        server_name: impl Into<String>,
    ) -> Self {
        Self {
            channels,
            whitelist,
            retry,
            server_name: server_name.into(),
        }
    }

    /// Channels from the configuration; `none` entries produce no channel.
    pub fn from_config(config: &Config, http: Arc<dyn HttpClient>) -> Self {
        let channels = config
            .notifications
            .channels
            .iter()
            .filter_map(|channel| -> Option<Arc<dyn Channel>> {
                match channel {
                    ChannelConfig::None => None,
                    ChannelConfig::Webhook {
                        url,
                        name,
                        level,
                        silent,
                        emojis,
                        colors,
                    } => Some(Arc::new(
                        WebhookChannel::new(url.clone(), name.clone(), Arc::clone(&http))
                            .with_level(*level)
                            .silent(*silent)
                            .with_overrides(StyleOverrides {
                                emojis: emojis.clone(),
                                colors: colors.clone(),
                                ..Default::default()
                            }),
                    )),
                    ChannelConfig::Push {
                        server_url,
                        topic,
                        name,
                        level,
                        emojis,
                        priorities,
                    } => Some(Arc::new(
                        PushChannel::new(server_url.clone(), topic.clone(), name.clone(), Arc::clone(&http))
                            .with_level(*level)
                            .with_overrides(StyleOverrides {
                                emojis: emojis.clone(),
                                priorities: priorities.clone(),
                                ..Default::default()
                            }),
                    )),
                }
            })
            .collect();

        Self::new(
            channels,
            config.notifications.whitelist.clone(),
            RetryPolicy::from_config(&config.notifications),
            config.server.name.clone(),
        )
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Subscribe every channel to `bus` and start its task.
    ///
    /// Subscriptions are taken before returning, so events published after
    /// this call are seen by every channel.
    pub fn spawn(self, bus: &EventBus) -> DispatcherTasks {
        if self.channels.is_empty() {
            tracing::info!("No notification channels configured");
        }

        let tasks = self
            .channels
            .into_iter()
            .map(|channel| {
                let label = channel.label();
                let subscription = bus.subscribe(format!("notify/{}", label));
                tracing::info!(channel = %label, "Starting notification channel");
                tokio::spawn(run_channel(
                    channel,
                    subscription,
                    self.whitelist.clone(),
                    self.retry,
                    self.server_name.clone(),
                ))
            })
            .collect();

        DispatcherTasks { tasks }
    }
}

/// Running channel tasks.
pub struct DispatcherTasks {
    tasks: Vec<JoinHandle<DeliveryStats>>,
}

impl DispatcherTasks {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every channel to drain its queue. Channels finish once the
    /// bus has been dropped.
    pub async fn join(self) -> DeliveryStats {
        let mut total = DeliveryStats::default();
        for task in self.tasks {
            match task.await {
                Ok(stats) => total += stats,
                Err(e) => tracing::error!(error = %e, "Notification task failed"),
            }
        }
        total
    }
}

#[tracing::instrument(skip_all, fields(channel = %channel.label()))]
async fn run_channel(
    channel: Arc<dyn Channel>,
    mut subscription: Subscription,
    whitelist: BTreeSet<EventKind>,
    retry: RetryPolicy,
    server_name: String,
) -> DeliveryStats {
    let mut stats = DeliveryStats::default();
    let level = channel.level();

    while let Some(event) = subscription.recv().await {
        if let Some(record) = event.log_level() {
            if !level.admits(record) {
                continue;
            }
        } else if !whitelist.contains(&event.kind) {
            tracing::trace!(kind = %event.kind, "Not whitelisted");
            continue;
        }

        let notification = Notification::from_event(&event, &server_name);
        if deliver_with_retry(channel.as_ref(), &notification, &retry).await {
            stats.delivered += 1;
        } else {
            stats.failed += 1;
        }
    }

    stats.lagged = subscription.dropped();
    tracing::debug!(?stats, "Notification channel stopped");
    stats
}

/// Deliver one notification, retrying per `policy`. Returns whether it
/// eventually got through.
pub async fn deliver_with_retry(
    channel: &dyn Channel,
    notification: &Notification,
    policy: &RetryPolicy,
) -> bool {
    let mut state = policy.start(Instant::now());

    loop {
        tokio::time::sleep_until(state.next_eligible).await;

        match channel.deliver(notification).await {
            Ok(()) => {
                tracing::debug!(kind = %notification.kind, attempt = state.attempt + 1, "Notification delivered");
                return true;
            }
            Err(e) => {
                if !state.record_failure(policy, Instant::now()) {
                    tracing::warn!(
                        kind = %notification.kind,
                        attempts = state.attempt,
                        error = %e,
                        "Giving up on notification"
                    );
                    return false;
                }
                tracing::debug!(
                    kind = %notification.kind,
                    attempt = state.attempt,
                    error = %e,
                    "Notification failed, retrying"
                );
            }
        }
    }
}
