/*!
 # Astro Supervisor

 A Rust library and daemon for supervising a dedicated game server process.

 ## Overview

 Astro Supervisor provides functionality to:
 - Install/update, start, stop and restart the server, optionally through a
   compatibility layer such as Wine
 - Classify the server's console output into typed events
 - Drive a lifecycle state machine with crash detection, start-up watchdogs
   and an optional restart policy
 - Fan events out to notification channels (chat webhooks, push topics),
   optionally together with the supervisor's own warnings and errors
 - Publish a status snapshot to an external endpoint
 - Periodically check the public IP and reachability of the server

 ## Basic Usage

 ```no_run
 use astro_supervisor::{Launcher, Result};

 #[tokio::main]
 async fn main() -> Result<()> {
     let running = Launcher::from_config_file("config.json")?.start()?;

     // Install/update and start the server
     running.handle().start().await?;

     // Watch what happens
     let mut events = running.subscribe("console");
     while let Some(event) = events.recv().await {
         println!("{} {:?}", event.kind, event.payload);
         # break;
     }

     // Graceful shutdown of the server and every background task
     let report = running.shutdown().await?;
     println!("Final state: {}", report.state);
     Ok(())
 }
 ```

 ## Architecture

 All state changes happen in one task, the [`Supervisor`]. Process output,
 operator commands and timers are funnelled into it; everything else only
 observes the [`Event`]s it publishes on the [`EventBus`]:

 ```text
 server stdout/stderr -> LineClassifier -> Supervisor -> EventBus -> notification channels
                                                                  -> status reporter
 network checker -------------------------------------> EventBus
 ```
*/

pub mod bus;
pub mod classifier;
pub mod config;
pub mod error;
pub mod event;
pub mod http;
pub mod installer;
pub mod logging;
pub mod notify;
pub mod server;
pub mod status;

pub use bus::{EventBus, Subscription};
pub use config::Config;
pub use error::{Error, Result};
pub use event::{Event, EventKind, Value};
pub use server::{ServerCommand, ServerState, Supervisor, SupervisorHandle};

use http::{HttpClient, UreqClient};
use installer::Installer;
use logging::LogForwarder;
use notify::{DeliveryStats, DispatcherTasks, NotificationDispatcher};
use server::NetworkMonitor;
use status::{StatusReporter, StatusSnapshot, StatusTracker};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Wires configuration, event bus, subscribers, supervisor and network
/// checker together.
///
/// This struct is the main entry point. All public methods are instrumented
/// with `tracing` spans.
pub struct Launcher {
    config: Config,
    http: Arc<dyn HttpClient>,
    installer: Option<Arc<dyn Installer>>,
    log_forwarder: Option<LogForwarder>,
}

impl Launcher {
    /// Load and validate a configuration file.
    #[tracing::instrument(skip(path), fields(config_path = ?path.as_ref()))]
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        tracing::info!("Loading configuration from file");
        let config = Config::from_file(path)?;
        config::validate_config(&config)?;
        Ok(Self::new(config))
    }

    /// Parse and validate a configuration string.
    #[tracing::instrument(skip(config))]
    pub fn from_config_str(config: &str) -> Result<Self> {
        tracing::info!("Loading configuration from string");
        let config = Config::parse_from_str(config)?;
        config::validate_config(&config)?;
        Ok(Self::new(config))
    }

    pub fn new(config: Config) -> Self {
        Self {
            config,
            http: Arc::new(UreqClient::new()),
            installer: None,
            log_forwarder: None,
        }
    }

    /// Use a different HTTP client for notifications, status and checks.
    pub fn with_http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = http;
        self
    }

    /// Override the installer selected from the configuration.
    pub fn with_installer(mut self, installer: Arc<dyn Installer>) -> Self {
        self.installer = Some(installer);
        self
    }

    /// Publish forwarded log records on the bus while running.
    pub fn with_log_forwarder(mut self, forwarder: LogForwarder) -> Self {
        self.log_forwarder = Some(forwarder);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start every background task. The server itself stays `Stopped` until
    /// a `start` command is sent.
    ///
    /// Subscribers are attached before the supervisor runs, so they see every
    /// event it publishes. Must be called from within a Tokio runtime.
    #[tracing::instrument(skip(self), fields(server = %self.config.server.name))]
    pub fn start(self) -> Result<RunningSupervisor> {
        config::validate_config(&self.config)?;

        let bus = EventBus::new(self.config.supervisor.event_queue_capacity);

        let notifications =
            NotificationDispatcher::from_config(&self.config, Arc::clone(&self.http)).spawn(&bus);
        tracing::debug!(channels = notifications.len(), "Notification channels started");

        let status = self.config.status.clone().map(|status_config| {
            let tracker =
                StatusTracker::new(self.config.server.name.clone(), self.config.server.max_players);
            StatusReporter::new(status_config, tracker, Arc::clone(&self.http)).spawn(&bus)
        });

        let (mut supervisor, handle) = Supervisor::new(&self.config, bus.clone())?;
        if let Some(installer) = self.installer {
            supervisor = supervisor.with_installer(installer);
        }
        let supervisor_task = tokio::spawn(supervisor.run());

        let checker = self.config.network.check_network.then(|| {
            let token = CancellationToken::new();
            let task = NetworkMonitor::new(&self.config, Arc::clone(&self.http), bus.clone())
                .spawn(token.clone());
            (token, task)
        });

        if let Some(forwarder) = &self.log_forwarder {
            forwarder.attach(bus.clone());
        }

        tracing::info!("Supervisor running");

        Ok(RunningSupervisor {
            handle,
            supervisor_task,
            bus,
            notifications,
            status,
            checker,
            log_forwarder: self.log_forwarder,
        })
    }
}

/// What was left when everything stopped.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub state: ServerState,
    pub notifications: DeliveryStats,
    pub status: Option<StatusSnapshot>,
}

/// Handles on the tasks started by [`Launcher::start`].
pub struct RunningSupervisor {
    handle: SupervisorHandle,
    supervisor_task: JoinHandle<ServerState>,
    bus: EventBus,
    notifications: DispatcherTasks,
    status: Option<JoinHandle<StatusSnapshot>>,
    checker: Option<(CancellationToken, JoinHandle<()>)>,
    log_forwarder: Option<LogForwarder>,
}

impl RunningSupervisor {
    /// Command channel to the supervisor.
    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    /// Extra subscriber, e.g. a console printer. Sees events published from
    /// now on.
    pub fn subscribe(&self, name: impl Into<String>) -> Subscription {
        self.bus.subscribe(name)
    }

    /// Global shutdown.
    ///
    /// Stops accepting commands and shuts the server down gracefully if it
    /// is alive. Subscribers are only stopped once the supervisor has
    /// finished, and they drain their queues first, so the final `shutdown`
    /// event still gets delivered.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(self) -> Result<ShutdownReport> {
        tracing::info!("Shutting down");

        if let Err(e) = self.handle.terminate().await {
            tracing::warn!(error = %e, "Supervisor was already gone");
        }
        drop(self.handle);

        let state = self
            .supervisor_task
            .await
            .map_err(|e| Error::Other(format!("Supervisor task failed: {}", e)))?;

        if let Some((token, task)) = self.checker {
            token.cancel();
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Network checker task failed");
            }
        }

        if let Some(forwarder) = &self.log_forwarder {
            forwarder.detach();
        }
        // Last sender: subscribers see the end of the stream after draining.
        drop(self.bus);

        let notifications = self.notifications.join().await;
        let status = match self.status {
            Some(task) => match task.await {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    tracing::warn!(error = %e, "Status reporter task failed");
                    None
                }
            },
            None => None,
        };

        tracing::info!(state = %state, ?notifications, "Shutdown complete");
        Ok(ShutdownReport {
            state,
            notifications,
            status,
        })
    }
}
