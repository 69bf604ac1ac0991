//! Run an external program for each envelope.
//!
//! The envelope is handed over through the environment. Output is streamed into the
//! log line by line while the child runs.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use super::{Action, ActionError, ActionKind};
use crate::Error;
use crate::envelope::Envelope;

/// Environment variable holding the serialized envelope.
pub const ENVELOPE_ENV: &str = "EVENT_ENVELOPE";
/// Environment variable holding the envelope's correlation id.
pub const CORRELATION_ID_ENV: &str = "CORRELATION_ID";

fn default_fail_on_stderr() -> bool {
    true
}

fn default_timeout() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalProcessConfig {
    #[serde(default)]
    pub name: Option<String>,
    /// Program to run.
    pub filename: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Treat the first stderr line as a failure and kill the child.
    #[serde(default = "default_fail_on_stderr")]
    pub fail_on_stderr: bool,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

pub struct ExternalProcessAction {
    name: String,
    config: Arc<ExternalProcessConfig>,
}

impl ExternalProcessAction {
    pub fn new(config: ExternalProcessConfig) -> Self {
        Self {
            name: config
                .name
                .clone()
                .unwrap_or_else(|| ActionKind::ExternalProcess.to_string()),
            config: Arc::new(config),
        }
    }
}

/// How the wait for the child ended.
enum Exit {
    Status(std::io::Result<ExitStatus>),
    Stderr,
    TimedOut,
    Cancelled,
}

/// Collected stderr lines. `first_line` fires once the first one arrives.
#[derive(Default, Clone)]
struct StderrLines {
    lines: Arc<Mutex<Vec<String>>>,
    first_line: CancellationToken,
}

fn spawn_stdout_reader(child: &mut Child) -> Option<JoinHandle<()>> {
    let stdout = child.stdout.take()?;
    Some(tokio::spawn(
        async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(stream = "stdout", "{line}");
            }
        }
        .in_current_span(),
    ))
}

fn spawn_stderr_reader(child: &mut Child, collected: StderrLines) -> Option<JoinHandle<()>> {
    let stderr = child.stderr.take()?;
    Some(tokio::spawn(
        async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(stream = "stderr", "{line}");
                collected.lines.lock().push(line);
                collected.first_line.cancel();
            }
        }
        .in_current_span(),
    ))
}

async fn run(
    config: &ExternalProcessConfig,
    envelope_json: &str,
    correlation_id: &str,
    cancel: &CancellationToken,
) -> crate::Result<()> {
    let mut command = Command::new(&config.filename);
    command
        .args(&config.arguments)
        .env(ENVELOPE_ENV, envelope_json)
        .env(CORRELATION_ID_ENV, correlation_id)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &config.working_directory {
        command.current_dir(dir);
    }

    let mut child = command
        .spawn()
        .map_err(|e| Error::io_path("spawning process", &config.filename, e))?;
    debug!(pid = child.id(), program = %config.filename, "Process started");

    let stderr = StderrLines::default();
    let readers: Vec<JoinHandle<()>> = [
        spawn_stdout_reader(&mut child),
        spawn_stderr_reader(&mut child, stderr.clone()),
    ]
    .into_iter()
    .flatten()
    .collect();

    let strict_stderr = async {
        if config.fail_on_stderr {
            stderr.first_line.cancelled().await
        } else {
            std::future::pending().await
        }
    };

    let exit = tokio::select! {
        biased;
        _ = cancel.cancelled() => Exit::Cancelled,
        _ = strict_stderr => Exit::Stderr,
        status = child.wait() => Exit::Status(status),
        _ = tokio::time::sleep(Duration::from_secs(config.timeout_secs)) => Exit::TimedOut,
    };

    let status = match exit {
        Exit::Status(status) => {
            for reader in readers {
                let _ = reader.await;
            }
            status.map_err(|e| Error::io_path("waiting for process", &config.filename, e))?
        }
        other => {
            if let Err(e) = child.kill().await {
                warn!(program = %config.filename, error = %e, "Failed to kill process");
            }
            for reader in &readers {
                reader.abort();
            }
            return Err(match other {
                Exit::Cancelled => Error::Cancelled,
                Exit::TimedOut => {
                    Error::Other(format!("process timed out after {}s", config.timeout_secs))
                }
                _ => {
                    let first = stderr.lines.lock().first().cloned().unwrap_or_default();
                    Error::Other(format!("process wrote to stderr: {first}"))
                }
            });
        }
    };

    if config.fail_on_stderr
        && let Some(first) = stderr.lines.lock().first()
    {
        return Err(Error::Other(format!("process wrote to stderr: {first}")));
    }
    if status.success() {
        return Ok(());
    }
    let code = status
        .code()
        .map_or_else(|| "a signal".to_string(), |c| format!("code {c}"));
    Err(Error::Other(format!(
        "process exited with {code}: {}",
        stderr.lines.lock().join("\n")
    )))
}

#[async_trait]
impl Action for ExternalProcessAction {
    fn kind(&self) -> ActionKind {
        ActionKind::ExternalProcess
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        envelope: &Envelope,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), ActionError> {
        let fail = |context: &str, e: Error| {
            ActionError::wrap(ActionKind::ExternalProcess, &self.name, context, e)
        };

        let envelope_json = envelope
            .to_json()
            .map_err(|e| fail("serializing envelope", e))?;
        let correlation_id = envelope.correlation_id().to_string();

        let started = Instant::now();
        run(&self.config, &envelope_json, &correlation_id, cancel)
            .await
            .map_err(|e| fail(&format!("running {}", self.config.filename), e))?;

        info!(
            program = %self.config.filename,
            duration_secs = started.elapsed().as_secs_f64(),
            "Process completed"
        );
        Ok(())
    }
}
