use anyhow::Context;
use astro_supervisor::config::{self, Config};
use astro_supervisor::logging::LogForwarder;
use astro_supervisor::{Launcher, ServerCommand};
use clap::Parser;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Supervise a dedicated game server: lifecycle, events, notifications and status.
#[derive(Debug, Parser)]
#[command(name = "astro-supervisor", version, about)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Wait for a `start` command instead of starting the server right away
    #[arg(long)]
    no_start: bool,

    /// Debug logging regardless of the configuration
    #[arg(short, long)]
    debug: bool,
}

fn init_logging(config: &Config, debug: bool, forwarder: &LogForwarder) -> anyhow::Result<WorkerGuard> {
    let level = if debug || config.supervisor.debug_logging {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let log_dir = &config.supervisor.log_path;
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "astro-supervisor.log"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .with(forwarder.layer())
        .init();

    Ok(guard)
}

fn spawn_command(handle: astro_supervisor::SupervisorHandle, command: ServerCommand) {
    tokio::spawn(async move {
        match handle.send(command).await {
            Ok(state) => tracing::info!(command = %command, state = %state, "Command finished"),
            Err(e) => tracing::warn!(command = %command, error = %e, "Command rejected"),
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    let forwarder = LogForwarder::from_config(&config);
    let _guard = init_logging(&config, cli.debug, &forwarder)?;

    config::validate_config(&config).context("Invalid configuration")?;
    tracing::info!(config = %cli.config.display(), server = %config.server.name, "Configuration loaded");

    let running = Launcher::new(config).with_log_forwarder(forwarder).start()?;
    let handle = running.handle();

    if !cli.no_start {
        if let Err(e) = handle.start().await {
            tracing::error!(error = %e, "Server could not be started");
            running.shutdown().await?;
            return Err(e).context("Startup failed");
        }
    }

    let mut console = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tracing::info!("Commands: start, shutdown, restart, status, exit");

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted");
                break;
            }
            line = console.next_line(), if console_open => match line {
                Ok(Some(line)) => {
                    let input = line.trim();
                    if input.is_empty() {
                        continue;
                    }
                    if matches!(input.to_ascii_lowercase().as_str(), "exit" | "quit") {
                        break;
                    }
                    match input.parse::<ServerCommand>() {
                        Ok(command) => spawn_command(handle.clone(), command),
                        Err(e) => tracing::warn!("{}", e),
                    }
                }
                Ok(None) => {
                    tracing::debug!("Console closed, waiting for Ctrl-C");
                    console_open = false;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Console unreadable, waiting for Ctrl-C");
                    console_open = false;
                }
            }
        }
    }

    let report = running.shutdown().await?;
    tracing::info!(
        state = %report.state,
        delivered = report.notifications.delivered,
        failed = report.notifications.failed,
        "Exiting"
    );
    Ok(())
}
