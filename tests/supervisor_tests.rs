#![cfg(unix)]

use astro_supervisor::bus::{EventBus, Subscription};
use astro_supervisor::config::Config;
use astro_supervisor::error::{Error, Result};
use astro_supervisor::event::{Event, EventKind, Value};
use astro_supervisor::installer::Installer;
use astro_supervisor::server::{ServerState, Supervisor, SupervisorHandle};
use astro_supervisor::status::StatusTracker;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const WELL_BEHAVED: &str = r#"
echo "Server starting..."
echo "Registering server..."
echo "Player 'Foo' joined (1/8)"
echo "Player 'Foo' left (0/8)"
while read -r line; do
  case "$line" in
    DSServerShutdown) echo "Shutting down"; exit 0 ;;
  esac
done
"#;

fn config_for(script: &str) -> Config {
    let mut config = Config::parse_from_str(r#"{ "server": { "executable": "sh", "name": "Test" } }"#).unwrap();
    config.server.args = vec!["-c".to_string(), script.to_string()];
    config.supervisor.shutdown_grace_secs = 5;
    config.supervisor.restart_delay_secs = 0;
    config
}

struct Harness {
    handle: SupervisorHandle,
    events: Subscription,
    task: JoinHandle<ServerState>,
}

impl Harness {
    fn start(config: &Config) -> Self {
        Self::with_supervisor(config, |supervisor| supervisor)
    }

    fn with_supervisor(config: &Config, adapt: impl FnOnce(Supervisor) -> Supervisor) -> Self {
        let bus = EventBus::new(64);
        let events = bus.subscribe("test");
        let (supervisor, handle) = Supervisor::new(config, bus).unwrap();
        let task = tokio::spawn(adapt(supervisor).run());
        Self { handle, events, task }
    }

    async fn next(&mut self) -> Event {
        tokio::time::timeout(Duration::from_secs(10), self.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event bus closed")
    }

    async fn next_kinds(&mut self, count: usize) -> Vec<EventKind> {
        let mut kinds = Vec::with_capacity(count);
        for _ in 0..count {
            kinds.push(self.next().await.kind);
        }
        kinds
    }

    /// Terminate and make sure nothing else was published.
    async fn finish(mut self) -> ServerState {
        let state = self.handle.terminate().await.unwrap();
        assert_eq!(self.task.await.unwrap(), state);
        while let Some(event) = self.events.recv().await {
            assert_ne!(event.kind, EventKind::Crash, "unexpected crash event: {:?}", event);
        }
        state
    }
}

#[tokio::test]
async fn test_graceful_session() -> Result<()> {
    let mut harness = Harness::start(&config_for(WELL_BEHAVED));

    assert_eq!(harness.handle.start().await?, ServerState::Starting);

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(harness.next().await);
    }
    assert_eq!(harness.handle.status().await?, ServerState::Running);

    assert_eq!(harness.handle.shutdown().await?, ServerState::Stopped);
    let shutdown = harness.next().await;
    assert_eq!(shutdown.get("forced"), Some(&Value::Bool(false)));
    assert_eq!(shutdown.get("exit_code"), Some(&Value::Int(0)));
    seen.push(shutdown);

    let kinds: Vec<_> = seen.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Start,
            EventKind::Registered,
            EventKind::PlayerJoin,
            EventKind::PlayerLeave,
            EventKind::Shutdown,
        ]
    );
    assert!(seen.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let mut tracker = StatusTracker::new("Test", 8);
    for event in &seen {
        tracker.apply(event);
    }
    assert_eq!(tracker.snapshot().player_count, 0);
    assert_eq!(tracker.snapshot().state, ServerState::Stopped);

    assert_eq!(harness.finish().await, ServerState::Stopped);
    Ok(())
}

#[tokio::test]
async fn test_grace_expiry_forces_stop() -> Result<()> {
    let mut config = config_for(
        r#"
echo "Server starting..."
echo "Registering server..."
exec sleep 30
"#,
    );
    config.supervisor.shutdown_grace_secs = 1;
    let mut harness = Harness::start(&config);

    harness.handle.start().await?;
    assert_eq!(harness.next_kinds(2).await, vec![EventKind::Start, EventKind::Registered]);

    assert_eq!(harness.handle.shutdown().await?, ServerState::Stopped);
    let shutdown = harness.next().await;
    assert_eq!(shutdown.kind, EventKind::Shutdown);
    assert_eq!(shutdown.get("forced"), Some(&Value::Bool(true)));

    assert_eq!(harness.finish().await, ServerState::Stopped);
    Ok(())
}

#[tokio::test]
async fn test_unexpected_exit_while_running_is_a_crash() -> Result<()> {
    let mut harness = Harness::start(&config_for(
        r#"
echo "Server starting..."
echo "Registering server..."
exit 3
"#,
    ));

    harness.handle.start().await?;
    assert_eq!(harness.next_kinds(2).await, vec![EventKind::Start, EventKind::Registered]);

    let crash = harness.next().await;
    assert_eq!(crash.kind, EventKind::Crash);
    assert_eq!(crash.get("reason"), Some(&Value::from("exit")));
    assert_eq!(crash.get("state"), Some(&Value::from("running")));
    assert_eq!(crash.get("exit_code"), Some(&Value::Int(3)));
    assert_eq!(harness.handle.status().await?, ServerState::Crashed);

    // Crashed is terminal without a restart policy, but an operator can start again.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.handle.status().await?, ServerState::Crashed);
    assert_eq!(harness.handle.start().await?, ServerState::Starting);
    assert_eq!(harness.next().await.kind, EventKind::Start);

    let state = harness.handle.terminate().await?;
    assert!(matches!(state, ServerState::Crashed | ServerState::Stopped));
    Ok(())
}

#[tokio::test]
async fn test_auto_restart_after_crash() -> Result<()> {
    let mut config = config_for(
        r#"
echo "Server starting..."
echo "Registering server..."
exit 1
"#,
    );
    config.supervisor.auto_restart = true;
    let mut harness = Harness::start(&config);

    harness.handle.start().await?;
    assert_eq!(
        harness.next_kinds(4).await,
        vec![EventKind::Start, EventKind::Registered, EventKind::Crash, EventKind::Start]
    );

    harness.handle.terminate().await?;
    Ok(())
}

#[tokio::test]
async fn test_restart_budget_is_bounded() -> Result<()> {
    let mut config = config_for(
        r#"
echo "Server starting..."
exit 1
"#,
    );
    config.supervisor.auto_restart = true;
    config.supervisor.max_restarts = 1;
    let mut harness = Harness::start(&config);

    harness.handle.start().await?;
    assert_eq!(
        harness.next_kinds(4).await,
        vec![EventKind::Start, EventKind::Crash, EventKind::Start, EventKind::Crash]
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(harness.handle.status().await?, ServerState::Crashed);
    assert_eq!(harness.handle.terminate().await?, ServerState::Crashed);
    assert!(harness.events.recv().await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_start_watchdog() -> Result<()> {
    let mut config = config_for("exec sleep 30");
    config.supervisor.start_timeout_secs = 1;
    let mut harness = Harness::start(&config);

    harness.handle.start().await?;
    let crash = harness.next().await;
    assert_eq!(crash.kind, EventKind::Crash);
    assert_eq!(crash.get("reason"), Some(&Value::from("watchdog")));
    assert_eq!(crash.get("state"), Some(&Value::from("starting")));
    assert_eq!(harness.handle.status().await?, ServerState::Crashed);

    harness.handle.terminate().await?;
    Ok(())
}

#[tokio::test]
async fn test_closed_output_is_a_crash() -> Result<()> {
    let mut harness = Harness::start(&config_for(
        r#"
echo "Server starting..."
exec >&- 2>&-
exec sleep 30
"#,
    ));

    harness.handle.start().await?;
    assert_eq!(harness.next().await.kind, EventKind::Start);

    let crash = harness.next().await;
    assert_eq!(crash.kind, EventKind::Crash);
    assert_eq!(crash.get("reason"), Some(&Value::from("output_closed")));

    harness.handle.terminate().await?;
    Ok(())
}

#[tokio::test]
async fn test_commands_rejected_in_wrong_state() -> Result<()> {
    let mut config = config_for("exec sleep 30");
    config.supervisor.shutdown_grace_secs = 1;
    let harness = Harness::start(&config);

    match harness.handle.shutdown().await {
        Err(Error::InvalidState { command, state }) => {
            assert_eq!(command, "shutdown");
            assert_eq!(state, ServerState::Stopped);
        }
        other => panic!("expected rejection, got {:?}", other),
    }

    harness.handle.start().await?;
    assert!(matches!(
        harness.handle.start().await,
        Err(Error::InvalidState { state: ServerState::Starting, .. })
    ));
    assert!(matches!(
        harness.handle.restart().await,
        Err(Error::InvalidState { state: ServerState::Starting, .. })
    ));
    assert!(matches!(
        harness.handle.shutdown().await,
        Err(Error::InvalidState { state: ServerState::Starting, .. })
    ));

    // Termination still halts a server that never finished starting.
    assert_eq!(harness.finish().await, ServerState::Stopped);
    Ok(())
}

#[tokio::test]
async fn test_restart_from_running() -> Result<()> {
    let mut harness = Harness::start(&config_for(WELL_BEHAVED));

    harness.handle.start().await?;
    harness.next_kinds(4).await;

    assert_eq!(harness.handle.restart().await?, ServerState::Starting);
    assert_eq!(
        harness.next_kinds(3).await,
        vec![EventKind::Shutdown, EventKind::Start, EventKind::Registered]
    );

    assert_eq!(harness.finish().await, ServerState::Stopped);
    Ok(())
}

#[tokio::test]
async fn test_terminate_shuts_running_server_down() -> Result<()> {
    let mut harness = Harness::start(&config_for(WELL_BEHAVED));

    harness.handle.start().await?;
    harness.next_kinds(4).await;

    assert_eq!(harness.handle.terminate().await?, ServerState::Stopped);
    assert_eq!(harness.next().await.kind, EventKind::Shutdown);
    assert!(matches!(
        harness.handle.start().await,
        Err(Error::SupervisorUnavailable(_))
    ));
    Ok(())
}

struct BrokenInstaller;

#[async_trait]
impl Installer for BrokenInstaller {
    async fn ensure_installed(&self) -> Result<()> {
        Err(Error::Install("depot unreachable".to_string()))
    }
}

/// An update that never finishes on its own.
struct HangingInstaller {
    cancelled: Arc<AtomicBool>,
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Installer for HangingInstaller {
    async fn ensure_installed(&self) -> Result<()> {
        let _guard = SetOnDrop(Arc::clone(&self.cancelled));
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_terminate_cancels_a_hanging_install() -> Result<()> {
    let cancelled = Arc::new(AtomicBool::new(false));
    let installer = Arc::new(HangingInstaller {
        cancelled: Arc::clone(&cancelled),
    });
    let harness = Harness::with_supervisor(&config_for(WELL_BEHAVED), |supervisor| {
        supervisor.with_installer(installer)
    });

    let handle = harness.handle.clone();
    let starting = tokio::spawn(async move { handle.start().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Still answering while the update runs.
    let state = tokio::time::timeout(Duration::from_secs(5), harness.handle.status())
        .await
        .expect("status blocked by the install")?;
    assert_eq!(state, ServerState::Stopped);
    assert!(matches!(
        harness.handle.shutdown().await,
        Err(Error::InvalidState { .. })
    ));

    let state = tokio::time::timeout(Duration::from_secs(5), harness.handle.terminate())
        .await
        .expect("terminate blocked by the install")?;
    assert_eq!(state, ServerState::Stopped);

    assert!(matches!(starting.await.unwrap(), Err(Error::SupervisorUnavailable(_))));
    assert!(cancelled.load(Ordering::SeqCst));
    assert_eq!(harness.task.await.unwrap(), ServerState::Stopped);
    Ok(())
}

#[tokio::test]
async fn test_installer_failure_keeps_server_stopped() -> Result<()> {
    let harness = Harness::with_supervisor(&config_for(WELL_BEHAVED), |supervisor| {
        supervisor.with_installer(Arc::new(BrokenInstaller))
    });

    assert!(matches!(harness.handle.start().await, Err(Error::Install(_))));
    assert_eq!(harness.handle.status().await?, ServerState::Stopped);
    assert_eq!(harness.finish().await, ServerState::Stopped);
    Ok(())
}
