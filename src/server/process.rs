// src/server/process.rs
use crate::classifier::{LineClassifier, decode_line};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::event::Event;
use async_process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use chrono::Utc;
use futures::{Stream, StreamExt};
use futures_lite::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

/// How long output is still collected after the process has exited.
///
/// Helpers spawned by the compatibility layer can keep the pipes open long
/// after the server itself is gone.
const DRAIN_AFTER_EXIT: Duration = Duration::from_secs(2);

/// How long a process whose output just ended gets to report its exit.
const EXIT_AFTER_CLOSE: Duration = Duration::from_secs(1);

/// Upper bound for writing one command to the server's stdin.
const STDIN_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifier of one spawned process run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(Uuid);

impl RunId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message from a process pump to the supervisor.
#[derive(Debug)]
pub struct ProcessMessage {
    pub run: RunId,
    pub output: ProcessOutput,
}

#[derive(Debug)]
pub enum ProcessOutput {
    /// A classified output line
    Event(Event),
    /// stdout and stderr reached end-of-file while the process stayed alive
    Closed,
    /// The process is gone; `None` when no exit code is available
    Exited { code: Option<i32> },
}

/// Launch recipe for the dedicated server.
///
/// When a compatibility layer is configured the server binary becomes the
/// first argument of the wrapper, e.g. `wine AstroServer.exe -log`.
#[derive(Debug, Clone)]
pub struct ServerProcess {
    config: ServerConfig,
}

impl ServerProcess {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Program and arguments as they will be executed.
    pub fn command_line(&self) -> (String, Vec<String>) {
        match &self.config.compat {
            Some(compat) => {
                let mut args = Vec::with_capacity(self.config.args.len() + 1);
                args.push(self.config.executable.clone());
                args.extend(self.config.args.iter().cloned());
                (compat.executable.clone(), args)
            }
            None => (self.config.executable.clone(), self.config.args.clone()),
        }
    }

    fn command(&self) -> Command {
        let (program, args) = self.command_line();
        let mut command = Command::new(program);
        command.args(args);

        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        if let Some(compat) = &self.config.compat {
            if !compat.env.contains_key("WINEDEBUG") {
                command.env("WINEDEBUG", "-all");
            }
            if let Some(prefix) = &compat.prefix {
                command.env("WINEPREFIX", prefix);
            }
            command.envs(&compat.env);
        }

        command.envs(&self.config.env);

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        command
    }

    /// Spawn the server and start pumping its output.
    ///
    /// Every output line is decoded, logged under the `server_output` target,
    /// classified and forwarded as [`ProcessOutput::Event`]. The pump always
    /// finishes with exactly one [`ProcessOutput::Exited`].
    pub fn spawn(
        &self,
        classifier: Arc<LineClassifier>,
        output: mpsc::UnboundedSender<ProcessMessage>,
    ) -> Result<ProcessHandle> {
        let (program, _) = self.command_line();
        let mut child = self
            .command()
            .spawn()
            .map_err(|e| Error::Process(format!("Failed to start process '{}': {}", program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Process("Failed to get stdin pipe from child process".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Process("Failed to get stdout pipe from child process".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Process("Failed to get stderr pipe from child process".to_string()))?;

        let run = RunId::new();
        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel();

        tracing::info!(run = %run, pid, program = %program, "Spawned server process");

        let lines = futures::stream::select(line_stream(stdout), line_stream(stderr));
        tokio::spawn(pump(run, child, lines, classifier, output, kill_rx));

        Ok(ProcessHandle {
            run,
            pid,
            stdin,
            kill: Some(kill_tx),
        })
    }
}

/// Exclusive handle on a running server process.
///
/// Owned by the supervisor only. Dropping it kills the process.
pub struct ProcessHandle {
    run: RunId,
    pid: u32,
    stdin: ChildStdin,
    kill: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    pub fn run(&self) -> RunId {
        self.run
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Write one line to the server's stdin.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let data = format!("{}\n", line);
        let write = async {
            self.stdin
                .write_all(data.as_bytes())
                .await
                .map_err(|e| Error::Process(format!("Failed to write to stdin: {}", e)))?;
            self.stdin
                .flush()
                .await
                .map_err(|e| Error::Process(format!("Failed to flush stdin: {}", e)))
        };

        tokio::time::timeout(STDIN_WRITE_TIMEOUT, write)
            .await
            .map_err(|_| Error::Timeout("Writing to server stdin".to_string()))?
    }

    /// Ask the pump to kill the process. Idempotent.
    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            tracing::warn!(run = %self.run, pid = self.pid, "Killing server process");
            let _ = kill.send(());
        }
    }
}

fn line_stream<R>(reader: R) -> impl Stream<Item = Vec<u8>> + Send
where
    R: AsyncRead + Unpin + Send + 'static,
{
    futures::stream::unfold(BufReader::new(reader), |mut reader| async move {
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => None,
            Ok(_) => Some((buf, reader)),
            Err(e) => {
                tracing::debug!(error = %e, "Output stream read failed");
                None
            }
        }
    })
}

async fn pump<S>(
    run: RunId,
    mut child: Child,
    lines: S,
    classifier: Arc<LineClassifier>,
    output: mpsc::UnboundedSender<ProcessMessage>,
    mut kill_rx: oneshot::Receiver<()>,
) where
    S: Stream<Item = Vec<u8>> + Send,
{
    let send = |output_msg: ProcessOutput| {
        let _ = output.send(ProcessMessage {
            run,
            output: output_msg,
        });
    };

    let mut lines = Box::pin(lines);
    let mut kill_requested = false;
    let mut exit: Option<std::io::Result<ExitStatus>> = None;
    let mut drain_deadline = Instant::now();

    loop {
        tokio::select! {
            line = lines.next() => match line {
                Some(raw) => {
                    let line = decode_line(&raw);
                    tracing::debug!(target: "server_output", run = %run, "{}", line);
                    if let Some(event) = classifier.classify_line(&line, Utc::now()) {
                        send(ProcessOutput::Event(event));
                    }
                }
                None => break,
            },
            status = child.status(), if exit.is_none() => {
                exit = Some(status);
                drain_deadline = Instant::now() + DRAIN_AFTER_EXIT;
            }
            _ = tokio::time::sleep_until(drain_deadline), if exit.is_some() => {
                tracing::debug!(run = %run, "Output still open after exit, no longer reading");
                break;
            }
            _ = &mut kill_rx, if !kill_requested => {
                kill_requested = true;
                if let Err(e) = child.kill() {
                    tracing::warn!(run = %run, error = %e, "Failed to kill server process");
                }
            }
        }
    }

    let status = match exit {
        Some(status) => status,
        None => match tokio::time::timeout(EXIT_AFTER_CLOSE, child.status()).await {
            Ok(status) => status,
            Err(_) => {
                send(ProcessOutput::Closed);
                if kill_requested {
                    child.status().await
                } else {
                    tokio::select! {
                        status = child.status() => status,
                        _ = &mut kill_rx => {
                            let _ = child.kill();
                            child.status().await
                        }
                    }
                }
            }
        },
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(run = %run, error = %e, "Failed to collect exit status");
            None
        }
    };

    tracing::info!(run = %run, exit_code = ?code, "Server process exited");
    send(ProcessOutput::Exited { code });
}
