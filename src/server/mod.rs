/// Server management module.
///
/// This module owns everything that touches the dedicated server process:
/// spawning it (optionally through a compatibility layer), pumping its output
/// through the line classifier, and driving the lifecycle state machine.
/// The periodic network checker lives here too since it reports on the same
/// server, although it never touches the process or its state.
///
/// # Components
///
/// * `lifecycle` - The `ServerState` machine and its legal transitions
/// * `process` - Process spawning and output pumping
/// * `supervisor` - The single task that owns process and state
/// * `monitor` - Periodic public IP and reachability checks
///
/// # Examples
///
/// Driving the state machine directly:
///
/// ```
/// use astro_supervisor::server::{Lifecycle, ServerState, Trigger};
///
/// let mut lifecycle = Lifecycle::new();
/// lifecycle.apply(Trigger::Start).unwrap();
/// lifecycle.apply(Trigger::StartDetected).unwrap();
/// assert_eq!(lifecycle.state(), ServerState::WaitingRegistration);
///
/// // A shutdown is only legal once the server is running.
/// assert!(lifecycle.apply(Trigger::Shutdown).is_err());
/// ```
///
/// Running a supervisor:
///
/// ```no_run
/// use astro_supervisor::bus::EventBus;
/// use astro_supervisor::config::Config;
/// use astro_supervisor::server::Supervisor;
///
/// # async fn run() -> astro_supervisor::Result<()> {
/// let config = Config::from_file("config.json")?;
/// let bus = EventBus::new(config.supervisor.event_queue_capacity);
/// let (supervisor, handle) = Supervisor::new(&config, bus)?;
/// tokio::spawn(supervisor.run());
///
/// handle.start().await?;
/// # Ok(())
/// # }
/// ```
pub mod lifecycle;
pub mod monitor;
mod process;
pub mod supervisor;

pub use lifecycle::{Lifecycle, ServerState, Transition, Trigger};
pub use monitor::{NetworkMonitor, NetworkReport};
pub use process::{ProcessHandle, ProcessMessage, ProcessOutput, RunId, ServerProcess};
pub use supervisor::{ServerCommand, Supervisor, SupervisorHandle};
