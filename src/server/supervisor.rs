use crate::bus::EventBus;
use crate::classifier::LineClassifier;
use crate::config::{Config, SupervisorConfig};
use crate::error::{Error, Result};
use crate::event::{Event, EventClock, EventKind};
use crate::installer::{self, Installer};
use crate::server::lifecycle::{Lifecycle, ServerState, Trigger};
use crate::server::process::{ProcessHandle, ProcessMessage, ProcessOutput, ServerProcess};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

const COMMAND_QUEUE: usize = 16;

/// Operator commands accepted by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCommand {
    /// Install/update if configured, then spawn the server
    Start,
    /// Graceful shutdown of a running server
    Shutdown,
    /// Shutdown followed by start, or a plain start after a crash
    Restart,
    /// Report the current state
    Status,
}

impl ServerCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerCommand::Start => "start",
            ServerCommand::Shutdown => "shutdown",
            ServerCommand::Restart => "restart",
            ServerCommand::Status => "status",
        }
    }
}

impl fmt::Display for ServerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerCommand {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(ServerCommand::Start),
            "shutdown" | "stop" => Ok(ServerCommand::Shutdown),
            "restart" => Ok(ServerCommand::Restart),
            "status" | "info" => Ok(ServerCommand::Status),
            other => Err(format!("unknown command '{}'", other)),
        }
    }
}

enum Request {
    Command {
        command: ServerCommand,
        reply: oneshot::Sender<Result<ServerState>>,
    },
    Terminate {
        reply: oneshot::Sender<ServerState>,
    },
}

/// Cloneable front door to the supervisor task.
///
/// All commands go through one channel and are executed one at a time by the
/// task that owns the server state.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Request>,
}

impl SupervisorHandle {
    /// Submit a command and wait for its outcome.
    ///
    /// `start` resolves once the process is spawned (`Starting`), `shutdown`
    /// once it has exited (`Stopped`), `restart` once the new process is
    /// spawned. Commands that are not legal in the current state fail with
    /// [`Error::InvalidState`].
    #[tracing::instrument(skip(self), fields(command = %command))]
    pub async fn send(&self, command: ServerCommand) -> Result<ServerState> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Command { command, reply })
            .await
            .map_err(|_| Error::SupervisorUnavailable("no longer accepting commands".to_string()))?;
        rx.await
            .map_err(|_| Error::SupervisorUnavailable("stopped before replying".to_string()))?
    }

    pub async fn start(&self) -> Result<ServerState> {
        self.send(ServerCommand::Start).await
    }

    pub async fn shutdown(&self) -> Result<ServerState> {
        self.send(ServerCommand::Shutdown).await
    }

    pub async fn restart(&self) -> Result<ServerState> {
        self.send(ServerCommand::Restart).await
    }

    pub async fn status(&self) -> Result<ServerState> {
        self.send(ServerCommand::Status).await
    }

    /// Stop accepting commands, shut the server down gracefully if it is
    /// alive, and end the supervisor task. Returns the final state.
    pub async fn terminate(&self) -> Result<ServerState> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Terminate { reply })
            .await
            .map_err(|_| Error::SupervisorUnavailable("already terminated".to_string()))?;
        rx.await
            .map_err(|_| Error::SupervisorUnavailable("stopped before replying".to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeadlineKind {
    /// Watchdog for the start line
    Start,
    /// Watchdog for the registration line
    Registration,
    /// Shutdown grace period
    Grace,
    /// Pending automatic restart
    Restart,
}

struct ActiveRun {
    handle: ProcessHandle,
    shutdown_requested: bool,
    forced: bool,
    failure: Option<&'static str>,
}

impl ActiveRun {
    fn new(handle: ProcessHandle) -> Self {
        Self {
            handle,
            shutdown_requested: false,
            forced: false,
            failure: None,
        }
    }

    /// Mark the run as failed and have it killed. The crash itself is
    /// reported once the process is gone.
    fn fail(&mut self, reason: &'static str) {
        if self.failure.is_none() {
            self.failure = Some(reason);
        }
        self.handle.kill();
    }
}

/// Owner of the server process and its lifecycle state.
///
/// Runs as a single task: operator commands, classified output, process exit
/// and timers are all handled sequentially by [`Supervisor::run`], so state
/// transitions never race. Other components only see the state through the
/// events published on the [`EventBus`].
pub struct Supervisor {
    process: ServerProcess,
    settings: SupervisorConfig,
    classifier: Arc<LineClassifier>,
    installer: Arc<dyn Installer>,
    bus: EventBus,
    clock: EventClock,
    lifecycle: Lifecycle,
    run: Option<ActiveRun>,
    requests: mpsc::Receiver<Request>,
    accepting: bool,
    output_tx: mpsc::UnboundedSender<ProcessMessage>,
    output_rx: mpsc::UnboundedReceiver<ProcessMessage>,
    deadline: Option<(Instant, DeadlineKind)>,
    restarts: u32,
    restart_after_stop: bool,
    stop_waiters: Vec<oneshot::Sender<Result<ServerState>>>,
    restart_waiters: Vec<oneshot::Sender<Result<ServerState>>>,
    terminate_waiters: Option<Vec<oneshot::Sender<ServerState>>>,
}

impl Supervisor {
    /// Build a supervisor from the configuration, publishing onto `bus`.
    pub fn new(config: &Config, bus: EventBus) -> Result<(Self, SupervisorHandle)> {
        let classifier = LineClassifier::from_config(&config.classifier)?;
        Ok(Self::from_parts(
            ServerProcess::new(config.server.clone()),
            config.supervisor.clone(),
            classifier,
            installer::from_config(&config.supervisor),
            bus,
        ))
    }

    pub fn from_parts(
        process: ServerProcess,
        settings: SupervisorConfig,
        classifier: LineClassifier,
        installer: Arc<dyn Installer>,
        bus: EventBus,
    ) -> (Self, SupervisorHandle) {
        let (tx, requests) = mpsc::channel(COMMAND_QUEUE);
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        let supervisor = Self {
            process,
            settings,
            classifier: Arc::new(classifier),
            installer,
            bus,
            clock: EventClock::new(),
            lifecycle: Lifecycle::new(),
            run: None,
            requests,
            accepting: true,
            output_tx,
            output_rx,
            deadline: None,
            restarts: 0,
            restart_after_stop: false,
            stop_waiters: Vec::new(),
            restart_waiters: Vec::new(),
            terminate_waiters: None,
        };

        (supervisor, SupervisorHandle { tx })
    }

    /// Replace the installer step, e.g. with a stub in tests.
    pub fn with_installer(mut self, installer: Arc<dyn Installer>) -> Self {
        self.installer = installer;
        self
    }

    pub fn state(&self) -> ServerState {
        self.lifecycle.state()
    }

    /// Drive the supervisor until it is terminated. Returns the final state.
    #[tracing::instrument(skip(self), fields(server = %self.process.config().name))]
    pub async fn run(mut self) -> ServerState {
        tracing::info!("Supervisor started");

        loop {
            if self.terminate_waiters.is_some() && self.run.is_none() {
                break;
            }

            let deadline = self.deadline.map(|(at, _)| at);

            tokio::select! {
                request = self.requests.recv(), if self.accepting => match request {
                    Some(Request::Command { command, reply }) => self.handle_command(command, reply).await,
                    Some(Request::Terminate { reply }) => self.begin_termination(Some(reply)).await,
                    None => self.begin_termination(None).await,
                },
                Some(message) = self.output_rx.recv() => self.handle_output(message).await,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.handle_deadline().await
                }
            }
        }

        let state = self.lifecycle.state();
        for reply in self.terminate_waiters.take().unwrap_or_default() {
            let _ = reply.send(state);
        }
        tracing::info!(state = %state, "Supervisor stopped");
        state
    }

    async fn handle_command(&mut self, command: ServerCommand, reply: oneshot::Sender<Result<ServerState>>) {
        tracing::info!(command = %command, state = %self.state(), "Operator command");

        match command {
            ServerCommand::Status => {
                let _ = reply.send(Ok(self.state()));
            }
            ServerCommand::Start => {
                let result = self.launch(command).await;
                let _ = reply.send(result);
            }
            ServerCommand::Shutdown => match self.request_stop(command, Trigger::Shutdown).await {
                Ok(()) => self.stop_waiters.push(reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            ServerCommand::Restart => match self.state() {
                ServerState::Running => match self.request_stop(command, Trigger::Shutdown).await {
                    Ok(()) => {
                        self.restart_after_stop = true;
                        self.restart_waiters.push(reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                },
                ServerState::Stopped | ServerState::Crashed => {
                    self.restarts = 0;
                    let result = self.launch(command).await;
                    let _ = reply.send(result);
                }
                state => {
                    let _ = reply.send(Err(Error::InvalidState {
                        command: command.to_string(),
                        state,
                    }));
                }
            },
        }
    }

    async fn begin_termination(&mut self, reply: Option<oneshot::Sender<ServerState>>) {
        tracing::info!(state = %self.state(), "Termination requested");

        self.accepting = false;
        self.requests.close();
        self.restart_after_stop = false;

        let waiters = self.terminate_waiters.get_or_insert_with(Vec::new);
        if let Some(reply) = reply {
            waiters.push(reply);
        }
        while let Ok(request) = self.requests.try_recv() {
            match request {
                Request::Terminate { reply } => waiters.push(reply),
                Request::Command { command, reply } => {
                    let _ = reply.send(Err(Error::SupervisorUnavailable(format!(
                        "terminating, '{}' not executed",
                        command
                    ))));
                }
            }
        }
        for reply in self.restart_waiters.drain(..) {
            let _ = reply.send(Err(Error::SupervisorUnavailable(
                "terminating, restart cancelled".to_string(),
            )));
        }

        match self.state() {
            ServerState::Starting | ServerState::WaitingRegistration | ServerState::Running => {
                if let Err(e) = self.request_stop(ServerCommand::Shutdown, Trigger::Halt).await {
                    tracing::error!(error = %e, "Could not begin graceful shutdown, killing server");
                    if let Some(run) = self.run.as_mut() {
                        run.shutdown_requested = true;
                        run.forced = true;
                        run.handle.kill();
                    }
                }
            }
            _ => {
                if matches!(self.deadline, Some((_, DeadlineKind::Restart))) {
                    self.deadline = None;
                }
            }
        }
    }

    /// Run the installer and spawn a new server process.
    async fn launch(&mut self, command: ServerCommand) -> Result<ServerState> {
        let state = self.state();
        if self.lifecycle.target(Trigger::Start).is_none() || self.run.is_some() {
            return Err(Error::InvalidState {
                command: command.to_string(),
                state,
            });
        }

        if let Err(e) = self.install().await {
            tracing::error!(error = %e, "Installer failed, server not started");
            return Err(e);
        }

        let handle = self
            .process
            .spawn(Arc::clone(&self.classifier), self.output_tx.clone())?;

        self.lifecycle.apply(Trigger::Start)?;
        self.run = Some(ActiveRun::new(handle));
        self.arm(DeadlineKind::Start);

        Ok(self.state())
    }

    /// Run the installer while still answering requests. `status` is served,
    /// other commands are refused, and termination cancels the install, which
    /// kills the updater process.
    async fn install(&mut self) -> Result<()> {
        let installer = Arc::clone(&self.installer);
        let install = installer.ensure_installed();
        tokio::pin!(install);

        loop {
            tokio::select! {
                result = &mut install => return result,
                request = self.requests.recv(), if self.accepting => match request {
                    Some(Request::Command { command: ServerCommand::Status, reply }) => {
                        let _ = reply.send(Ok(self.state()));
                    }
                    Some(Request::Command { command, reply }) => {
                        tracing::warn!(command = %command, "Refusing command while installing");
                        let _ = reply.send(Err(Error::InvalidState {
                            command: command.to_string(),
                            state: self.state(),
                        }));
                    }
                    Some(Request::Terminate { reply }) => {
                        self.begin_termination(Some(reply)).await;
                        return Err(Error::SupervisorUnavailable("terminating, start cancelled".to_string()));
                    }
                    None => {
                        self.begin_termination(None).await;
                        return Err(Error::SupervisorUnavailable("terminating, start cancelled".to_string()));
                    }
                },
            }
        }
    }

    /// Move to `Stopping` and send the shutdown instruction.
    async fn request_stop(&mut self, command: ServerCommand, trigger: Trigger) -> Result<()> {
        let state = self.state();
        if self.lifecycle.target(trigger).is_none() || self.run.is_none() {
            return Err(Error::InvalidState {
                command: command.to_string(),
                state,
            });
        }

        self.lifecycle.apply(trigger)?;

        if let Some(run) = self.run.as_mut() {
            run.shutdown_requested = true;
            let instruction = &self.process.config().shutdown_command;
            if let Err(e) = run.handle.write_line(instruction).await {
                tracing::warn!(error = %e, "Failed to send shutdown instruction");
            }
        }

        self.arm(DeadlineKind::Grace);
        Ok(())
    }

    async fn handle_output(&mut self, message: ProcessMessage) {
        let current = self.run.as_ref().map(|run| run.handle.run());
        if current != Some(message.run) {
            tracing::debug!(run = %message.run, "Ignoring output from a finished run");
            return;
        }

        match message.output {
            ProcessOutput::Event(event) => self.handle_event(event),
            ProcessOutput::Closed => {
                let state = self.state();
                if let Some(run) = self.run.as_mut() {
                    if !run.shutdown_requested && run.failure.is_none() {
                        tracing::warn!(state = %state, "Server output closed without a shutdown request");
                        run.fail("output_closed");
                    }
                }
            }
            ProcessOutput::Exited { code } => self.handle_exit(code).await,
        }
    }

    fn handle_event(&mut self, event: Event) {
        let state = self.state();
        match self.run.as_ref() {
            Some(run) if run.failure.is_none() => {}
            Some(_) => {
                tracing::debug!(kind = %event.kind, "Ignoring output from a failing run");
                return;
            }
            None => return,
        }

        match event.kind {
            EventKind::Start => {
                if state == ServerState::Starting && self.lifecycle.apply(Trigger::StartDetected).is_ok() {
                    self.arm(DeadlineKind::Registration);
                    self.publish(event);
                } else {
                    tracing::debug!(state = %state, "Ignoring start line");
                }
            }
            EventKind::Registered => {
                if state == ServerState::WaitingRegistration
                    && self.lifecycle.apply(Trigger::RegisteredDetected).is_ok()
                {
                    self.deadline = None;
                    self.restarts = 0;
                    tracing::info!("Server registered and running");
                    self.publish(event);
                } else {
                    tracing::debug!(state = %state, "Ignoring registration line");
                }
            }
            EventKind::Shutdown => {
                // Reported by the supervisor itself once the process is gone.
                tracing::info!(state = %state, "Server announced shutdown");
            }
            EventKind::Crash => {
                if let Some(run) = self.run.as_mut().filter(|run| !run.shutdown_requested) {
                    tracing::warn!(state = %state, "Server reported a fatal error");
                    run.fail("reported");
                }
            }
            _ => self.publish(event),
        }
    }

    async fn handle_exit(&mut self, code: Option<i32>) {
        let Some(run) = self.run.take() else {
            return;
        };
        self.deadline = None;
        let from = self.state();

        let transition = match self.lifecycle.apply(Trigger::Exited) {
            Ok(transition) => transition,
            Err(e) => {
                tracing::error!(error = %e, "Process exit in unexpected state");
                return;
            }
        };

        if transition.to == ServerState::Stopped {
            let mut event = Event::new(EventKind::Shutdown).with("forced", run.forced);
            if let Some(code) = code {
                event = event.with("exit_code", code);
            }
            tracing::info!(forced = run.forced, exit_code = ?code, "Server stopped");
            self.publish(event);

            for reply in self.stop_waiters.drain(..) {
                let _ = reply.send(Ok(ServerState::Stopped));
            }

            if self.restart_after_stop {
                self.restart_after_stop = false;
                self.restarts = 0;
                let result = self.launch(ServerCommand::Restart).await;
                for reply in self.restart_waiters.drain(..) {
                    let _ = reply.send(match &result {
                        Ok(state) => Ok(*state),
                        Err(e) => Err(Error::Process(format!("Restart failed: {}", e))),
                    });
                }
            }
            return;
        }

        let reason = run.failure.unwrap_or("exit");
        let mut event = Event::new(EventKind::Crash)
            .with("reason", reason)
            .with("state", from.as_str());
        if let Some(code) = code {
            event = event.with("exit_code", code);
        }
        tracing::error!(reason, from = %from, exit_code = ?code, skip_notify = true, "Server crashed");
        self.publish(event);

        self.schedule_restart();
    }

    fn schedule_restart(&mut self) {
        if self.terminate_waiters.is_some() {
            return;
        }
        if !self.settings.auto_restart {
            tracing::warn!("Automatic restart disabled, waiting for an operator command");
            return;
        }
        if self.restarts >= self.settings.max_restarts {
            tracing::error!(
                restarts = self.restarts,
                "Restart limit reached, waiting for an operator command"
            );
            return;
        }

        self.restarts += 1;
        tracing::info!(
            attempt = self.restarts,
            delay_secs = self.settings.restart_delay_secs,
            "Scheduling automatic restart"
        );
        self.arm(DeadlineKind::Restart);
    }

    async fn handle_deadline(&mut self) {
        let Some((_, kind)) = self.deadline.take() else {
            return;
        };
        let state = self.state();

        match kind {
            DeadlineKind::Start | DeadlineKind::Registration => {
                if let Some(run) = self.run.as_mut() {
                    tracing::error!(state = %state, watchdog = ?kind, "Server did not come up in time");
                    run.fail("watchdog");
                }
            }
            DeadlineKind::Grace => {
                if let Some(run) = self.run.as_mut() {
                    tracing::warn!("Shutdown grace period elapsed, forcing termination");
                    run.forced = true;
                    run.handle.kill();
                }
            }
            DeadlineKind::Restart => {
                if state == ServerState::Crashed && self.terminate_waiters.is_none() {
                    if let Err(e) = self.launch(ServerCommand::Restart).await {
                        tracing::error!(error = %e, "Automatic restart failed");
                    }
                }
            }
        }
    }

    fn arm(&mut self, kind: DeadlineKind) {
        let after = match kind {
            DeadlineKind::Start => self.settings.start_timeout(),
            DeadlineKind::Registration => self.settings.registration_timeout(),
            DeadlineKind::Grace => self.settings.shutdown_grace(),
            DeadlineKind::Restart => self.settings.restart_delay(),
        };
        self.deadline = Some((Instant::now() + after, kind));
    }

    fn publish(&mut self, event: Event) {
        let event = self.clock.stamp(event);
        tracing::info!(kind = %event.kind, payload = ?event.payload, skip_notify = true, "Server event");
        self.bus.publish(event);
    }
}
