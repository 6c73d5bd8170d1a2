//! Content filter subprocess.
//!
//! Every received message is written to the filter as one JSON object per line
//! on its stdin, and the filter answers with one JSON value per line on stdout:
//!
//! * `null` drops the message,
//! * `{}` accepts it unchanged,
//! * an object with any of `Number`, `SourceId`, `Body`, `Note` accepts it with
//!   those fields replaced. Fields of the wrong type are ignored.
//!
//! The filter is started on first use and kept running between messages.
//! Anything it writes to stderr is reported when it closes stdout.

use crate::error::FilterError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Most stderr kept for an error report.
const STDERR_LIMIT: u64 = 16 * 1024;
const STDERR_WAIT: Duration = Duration::from_secs(1);
/// How long a filter may take to answer one message.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// The record exchanged with the filter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FilterExchange {
    pub time: DateTime<Utc>,
    pub number: String,
    pub source_id: i64,
    pub body: String,
    pub note: String,
}

/// The pipes of one running filter instance.
pub struct FilterChild {
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    stdout: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    stderr: Box<dyn AsyncRead + Send + Unpin>,
    process: Option<Child>,
}

impl FilterChild {
    pub fn from_pipes<W, R, E>(stdin: W, stdout: R, stderr: E) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
        E: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            stdin: Box::new(stdin),
            stdout: BufReader::new(Box::new(stdout)),
            stderr: Box::new(stderr),
            process: None,
        }
    }

    pub fn from_process(mut process: Child) -> io::Result<Self> {
        let missing = || io::Error::new(io::ErrorKind::BrokenPipe, "filter pipe was not captured");
        let stdin = process.stdin.take().ok_or_else(missing)?;
        let stdout = process.stdout.take().ok_or_else(missing)?;
        let stderr = process.stderr.take().ok_or_else(missing)?;
        let mut child = Self::from_pipes(stdin, stdout, stderr);
        child.process = Some(process);
        Ok(child)
    }

    async fn write_record(&mut self, line: &[u8]) -> io::Result<()> {
        self.stdin.write_all(line).await?;
        self.stdin.flush().await
    }

    /// `None` once the filter has closed stdout.
    async fn read_record(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        if self.stdout.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(line))
    }

    async fn drain_stderr(&mut self) -> String {
        let mut buf = Vec::new();
        let mut limited = (&mut self.stderr).take(STDERR_LIMIT);
        let _ = tokio::time::timeout(STDERR_WAIT, limited.read_to_end(&mut buf)).await;
        String::from_utf8_lossy(&buf).trim().to_string()
    }

    async fn reap(self) {
        let FilterChild { stdin, process, .. } = self;
        drop(stdin);
        if let Some(mut process) = process {
            let _ = process.kill().await;
        }
    }
}

/// Starts filter instances.
pub trait Launch: Send + Sync {
    fn launch(&self) -> io::Result<FilterChild>;

    fn command(&self) -> &str;
}

/// Runs the filter command through `sh -c`.
pub struct ShellCommand {
    command: String,
}

impl ShellCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Launch for ShellCommand {
    fn launch(&self) -> io::Result<FilterChild> {
        let process = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        debug!(pid = ?process.id(), command = %self.command, "Filter process spawned");
        FilterChild::from_process(process)
    }

    fn command(&self) -> &str {
        &self.command
    }
}

enum ChildState {
    NotStarted,
    Running(FilterChild),
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnWriteFailure {
    Restart,
    GiveUp,
}

/// A write failure most likely means the filter exited after the previous
/// message, so one restart per call is allowed.
fn on_write_failure(restarts: u32) -> OnWriteFailure {
    if restarts == 0 {
        OnWriteFailure::Restart
    } else {
        OnWriteFailure::GiveUp
    }
}

pub struct FilterPipeline {
    launcher: Box<dyn Launch>,
    state: ChildState,
    response_timeout: Duration,
}

impl FilterPipeline {
    pub fn new(launcher: impl Launch + 'static) -> Self {
        Self {
            launcher: Box::new(launcher),
            state: ChildState::NotStarted,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// A filter that has not answered by then is killed and the message accepted.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn shell(command: &str) -> Self {
        Self::new(ShellCommand::new(command))
    }

    pub fn command(&self) -> &str {
        self.launcher.command()
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        matches!(self.state, ChildState::Running(_))
    }

    /// Passes `msg` through the filter, updating it in place.
    ///
    /// `Ok(false)` means the filter dropped the message.
    pub async fn filter(&mut self, msg: &mut FilterExchange) -> Result<bool, FilterError> {
        let mut line = serde_json::to_vec(msg)?;
        line.push(b'\n');

        let mut restarts = 0;
        let mut child = loop {
            let mut child = self.take_or_launch()?;
            match child.write_record(&line).await {
                Ok(()) => break child,
                Err(e) => {
                    child.reap().await;
                    match on_write_failure(restarts) {
                        OnWriteFailure::Restart => {
                            warn!(command = %self.command(), "Can't write to filter, restarting it: {}", e);
                            restarts += 1;
                        }
                        OnWriteFailure::GiveUp => {
                            return Err(FilterError::Write {
                                command: self.command().to_string(),
                                source: e,
                            });
                        }
                    }
                }
            }
        };

        let read = tokio::time::timeout(self.response_timeout, child.read_record()).await;
        let Ok(read) = read else {
            child.reap().await;
            return Err(FilterError::Timeout {
                command: self.command().to_string(),
                waited: self.response_timeout,
            });
        };
        let response = match read {
            Ok(Some(response)) => response,
            Ok(None) => {
                let stderr = child.drain_stderr().await;
                child.reap().await;
                return Err(FilterError::Exited {
                    command: self.command().to_string(),
                    stderr,
                });
            }
            Err(source) => {
                child.reap().await;
                return Err(FilterError::Read {
                    command: self.command().to_string(),
                    source,
                });
            }
        };

        let value = match serde_json::from_str::<Value>(&response) {
            Ok(value) => value,
            Err(source) => {
                // The stream can't be trusted to be in step any more.
                child.reap().await;
                return Err(FilterError::Decode {
                    command: self.command().to_string(),
                    source,
                });
            }
        };
        self.state = ChildState::Running(child);

        match value {
            Value::Null => Ok(false),
            Value::Object(fields) => {
                apply_overrides(msg, &fields);
                Ok(true)
            }
            other => Err(FilterError::Unexpected {
                command: self.command().to_string(),
                response: other.to_string(),
            }),
        }
    }

    /// Stops a running filter.
    pub async fn close(&mut self) {
        if let ChildState::Running(child) = std::mem::replace(&mut self.state, ChildState::Dead) {
            child.reap().await;
        }
    }

    /// Leaves the state `Dead` until the child is handed back.
    fn take_or_launch(&mut self) -> Result<FilterChild, FilterError> {
        match std::mem::replace(&mut self.state, ChildState::Dead) {
            ChildState::Running(child) => Ok(child),
            previous => {
                let child = self.launcher.launch().map_err(|source| FilterError::Spawn {
                    command: self.command().to_string(),
                    source,
                })?;
                if matches!(previous, ChildState::NotStarted) {
                    info!(command = %self.command(), "Filter started");
                } else {
                    info!(command = %self.command(), "Filter restarted");
                }
                Ok(child)
            }
        }
    }
}

fn apply_overrides(msg: &mut FilterExchange, fields: &Map<String, Value>) {
    if let Some(number) = fields.get("Number").and_then(Value::as_str) {
        msg.number = number.to_string();
    }
    if let Some(id) = fields.get("SourceId").and_then(positive_id) {
        msg.source_id = id;
    }
    if let Some(body) = fields.get("Body").and_then(Value::as_str) {
        msg.body = body.to_string();
    }
    if let Some(note) = fields.get("Note").and_then(Value::as_str) {
        msg.note = note.to_string();
    }
}

fn positive_id(value: &Value) -> Option<i64> {
    let id = value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f <= i64::MAX as f64)
            .map(|f| f as i64)
    })?;
    (id > 0).then_some(id)
}
