//! Installer/updater step run before every server start.
//!
//! The supervisor treats installation as a black box that either succeeds or
//! keeps the server from entering `Starting`.

use crate::config::{SupervisorConfig, UpdaterConfig};
use crate::error::{Error, Result};
use async_process::{Command, Stdio};
use async_trait::async_trait;
use futures_lite::io::{AsyncBufReadExt, BufReader};
use futures_lite::StreamExt;
use std::sync::Arc;

/// Brings the server installation up to date.
#[async_trait]
pub trait Installer: Send + Sync {
    /// Install or update the server. Must finish before the server starts.
    async fn ensure_installed(&self) -> Result<()>;
}

/// Installer that does nothing; used when auto-update is off.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInstaller;

#[async_trait]
impl Installer for NoopInstaller {
    async fn ensure_installed(&self) -> Result<()> {
        Ok(())
    }
}

/// Runs an external update tool and waits for it.
///
/// The tool's output is forwarded to the log under the `installer` target.
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    config: UpdaterConfig,
}

impl CommandInstaller {
    pub fn new(config: UpdaterConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Installer for CommandInstaller {
    #[tracing::instrument(skip(self), fields(command = %self.config.command))]
    async fn ensure_installed(&self) -> Result<()> {
        tracing::info!("Running server updater");

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Install(format!("Failed to start updater: {}", e)))?;

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => tracing::info!(target: "installer", "{}", line),
                    Err(e) => {
                        tracing::debug!(error = %e, "Updater output no longer readable");
                        break;
                    }
                }
            }
        }

        let status = child
            .status()
            .await
            .map_err(|e| Error::Install(format!("Failed to wait for updater: {}", e)))?;

        if status.success() {
            tracing::info!("Server updater finished");
            Ok(())
        } else {
            Err(Error::Install(format!("Updater exited with {}", status)))
        }
    }
}

/// Installer selected by the supervisor configuration.
pub fn from_config(config: &SupervisorConfig) -> Arc<dyn Installer> {
    match (&config.updater, config.auto_update) {
        (Some(updater), true) => Arc::new(CommandInstaller::new(updater.clone())),
        _ => Arc::new(NoopInstaller),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sh(script: &str) -> CommandInstaller {
        CommandInstaller::new(UpdaterConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
        })
    }

    #[tokio::test]
    async fn test_successful_update() {
        sh("echo updating; echo done").ensure_installed().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_update() {
        let err = sh("echo broken; exit 7").ensure_installed().await.unwrap_err();
        assert!(matches!(err, Error::Install(_)));
    }

    #[tokio::test]
    async fn test_auto_update_off_skips_updater() {
        let mut config = SupervisorConfig {
            auto_update: false,
            updater: Some(UpdaterConfig {
                command: "false".to_string(),
                args: Vec::new(),
                env: HashMap::new(),
            }),
            ..SupervisorConfig::default()
        };
        from_config(&config).ensure_installed().await.unwrap();

        config.auto_update = true;
        assert!(from_config(&config).ensure_installed().await.is_err());
    }
}
