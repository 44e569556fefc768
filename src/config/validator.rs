use crate::config::{ChannelConfig, Config, ServerConfig};
use crate::error::{Error, Result};
use regex::Regex;
use std::path::Path;

/// Validates the server launch settings.
///
/// A missing executable is fatal: the supervisor must not enter `Starting`
/// for a binary that does not exist. Bare command names (no path separator)
/// are left to `PATH` resolution at spawn time.
pub fn validate_server_config(config: &ServerConfig) -> Result<()> {
    if config.executable.trim().is_empty() {
        return Err(Error::ConfigInvalid("Server executable is empty".to_string()));
    }

    let executable = match &config.working_dir {
        Some(dir) if Path::new(&config.executable).is_relative() => dir.join(&config.executable),
        _ => Path::new(&config.executable).to_path_buf(),
    };
    let looks_like_path = config.executable.contains('/') || config.executable.contains('\\');
    if looks_like_path && !executable.is_file() {
        return Err(Error::ConfigInvalid(format!(
            "Server executable not found: {}",
            executable.display()
        )));
    }

    if let Some(dir) = &config.working_dir {
        if !dir.is_dir() {
            return Err(Error::ConfigInvalid(format!(
                "Working directory does not exist: {}",
                dir.display()
            )));
        }
    }

    if let Some(compat) = &config.compat {
        if compat.executable.trim().is_empty() {
            return Err(Error::ConfigInvalid(
                "Compatibility layer executable is empty".to_string(),
            ));
        }
    }

    if config.shutdown_command.trim().is_empty() {
        return Err(Error::ConfigInvalid("Shutdown command is empty".to_string()));
    }

    Ok(())
}

/// Validates notification channels.
pub fn validate_channels(channels: &[ChannelConfig]) -> Result<()> {
    for channel in channels {
        if let ChannelConfig::Push { topic, .. } = channel {
            if topic.trim().is_empty() {
                return Err(Error::ConfigInvalid(
                    "Push channel requires a non-empty topic".to_string(),
                ));
            }
        }
    }
    Ok(())
}

/// Full configuration validation
pub fn validate_config(config: &Config) -> Result<()> {
    validate_server_config(&config.server)?;
    validate_channels(&config.notifications.channels)?;

    let supervisor = &config.supervisor;
    if supervisor.event_queue_capacity == 0 {
        return Err(Error::ConfigInvalid("eventQueueCapacity must be positive".to_string()));
    }
    if supervisor.start_timeout_secs == 0 || supervisor.registration_timeout_secs == 0 {
        return Err(Error::ConfigInvalid("Startup timeouts must be positive".to_string()));
    }
    if let Some(updater) = &supervisor.updater {
        if updater.command.trim().is_empty() {
            return Err(Error::ConfigInvalid("Updater command is empty".to_string()));
        }
    }

    if let Some(status) = &config.status {
        if status.interval_secs == 0 {
            return Err(Error::ConfigInvalid("status.intervalSecs must be positive".to_string()));
        }
    }

    if config.network.check_network && config.network.check_interval_secs == 0 {
        return Err(Error::ConfigInvalid(
            "network.checkIntervalSecs must be positive".to_string(),
        ));
    }

    for pattern in &config.classifier.patterns {
        Regex::new(&pattern.regex).map_err(|e| {
            Error::ConfigInvalid(format!(
                "Invalid pattern for '{}': {}",
                pattern.kind, e
            ))
        })?;
    }

    Ok(())
}
