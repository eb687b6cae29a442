//! The device tool as seen by a worker: binaries are written into a work
//! directory, then sub-commands run one at a time with their output streamed.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::Binaries;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("`{command}` exited with status {code:?}")]
    Failure { command: String, code: Option<i32> },
    #[error("could not start `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid binary name {0:?}")]
    InvalidName(String),
    #[error("command was cancelled")]
    Cancelled,
    #[error("session timed out")]
    SessionTimeout,
}

#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Writes every binary into the work directory under its own name.
    async fn write_files(&self, binaries: &Binaries) -> Result<(), ExecutorError>;

    /// Starts the tool with `args`, e.g. `["load-bitstream", "top.bit"]`.
    fn spawn(&self, args: &[String]) -> Result<ExecProcess, ExecutorError>;
}

/// A running tool invocation. Dropping it kills the process.
pub struct ExecProcess {
    command: String,
    output: mpsc::UnboundedReceiver<Vec<u8>>,
    exit: Option<oneshot::Receiver<Option<i32>>>,
    kill: CancellationToken,
}

/// The producing side of an [`ExecProcess`].
pub struct ProcessIo {
    pub output: mpsc::UnboundedSender<Vec<u8>>,
    /// Receives the exit code, `None` when the process died from a signal.
    /// Dropping it unsent reports a cancelled process.
    pub exit: oneshot::Sender<Option<i32>>,
    pub killed: CancellationToken,
}

impl ExecProcess {
    pub fn channel(command: impl Into<String>) -> (Self, ProcessIo) {
        let (output_tx, output) = mpsc::unbounded_channel();
        let (exit_tx, exit) = oneshot::channel();
        let kill = CancellationToken::new();
        (
            Self {
                command: command.into(),
                output,
                exit: Some(exit),
                kill: kill.clone(),
            },
            ProcessIo {
                output: output_tx,
                exit: exit_tx,
                killed: kill,
            },
        )
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Next chunk of stdout or stderr; `None` once both are closed.
    pub async fn output(&mut self) -> Option<Vec<u8>> {
        self.output.recv().await
    }

    /// Waits for the process to exit and maps a non-zero status to [`ExecutorError::Failure`].
    pub async fn wait(&mut self) -> Result<(), ExecutorError> {
        let Some(exit) = self.exit.take() else {
            return Err(ExecutorError::Cancelled);
        };
        match exit.await {
            Ok(Some(0)) => Ok(()),
            Ok(code) => Err(ExecutorError::Failure {
                command: self.command.clone(),
                code,
            }),
            Err(_) => Err(ExecutorError::Cancelled),
        }
    }

    pub fn kill(&self) {
        self.kill.cancel();
    }
}

impl Drop for ExecProcess {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

fn check_name(name: &str) -> Result<(), ExecutorError> {
    if Path::new(name).file_name() == Some(OsStr::new(name)) {
        Ok(())
    } else {
        Err(ExecutorError::InvalidName(name.to_string()))
    }
}

// -----------------------------------------------------------------------------
// Tool
// -----------------------------------------------------------------------------

/// Runs `<tool> <prefix..> <args..>` inside the work directory.
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    tool: String,
    prefix: Vec<String>,
    workdir: PathBuf,
}

impl ToolExecutor {
    pub fn new(tool: impl Into<String>, prefix: Vec<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            prefix,
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }
}

async fn forward(mut reader: impl AsyncRead + Unpin, output: mpsc::UnboundedSender<Vec<u8>>) {
    let mut buf = vec![0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if output.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(error = %err, "tool output closed");
                break;
            }
        }
    }
}

#[async_trait]
impl Executor for ToolExecutor {
    async fn write_files(&self, binaries: &Binaries) -> Result<(), ExecutorError> {
        tokio::fs::create_dir_all(&self.workdir).await?;
        for (name, bytes) in binaries {
            check_name(name)?;
            tokio::fs::write(self.workdir.join(name), bytes).await?;
        }
        Ok(())
    }

    fn spawn(&self, args: &[String]) -> Result<ExecProcess, ExecutorError> {
        let command = args.join(" ");
        let mut child = TokioCommand::new(&self.tool)
            .args(&self.prefix)
            .args(args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                command: command.clone(),
                source,
            })?;
        debug!(tool = %self.tool, %command, pid = ?child.id(), "tool started");

        let (process, io) = ExecProcess::channel(command);
        let ProcessIo {
            output,
            exit,
            killed,
        } = io;
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward(stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward(stderr, output));
        }

        tokio::spawn(async move {
            let cancelled = tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => {
                            let _ = exit.send(status.code());
                        }
                        Err(err) => warn!(error = %err, "lost track of tool process"),
                    }
                    false
                }
                _ = killed.cancelled() => true,
            };
            if cancelled {
                let _ = child.kill().await;
            }
        });
        Ok(process)
    }
}

// -----------------------------------------------------------------------------
// Scripted
// -----------------------------------------------------------------------------

/// Canned behaviour for one sub-command of a [`ScriptedExecutor`].
#[derive(Debug, Clone)]
pub struct Script {
    output: Vec<(Duration, Vec<u8>)>,
    code: Option<i32>,
    hang: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            output: Vec::new(),
            code: Some(0),
            hang: false,
        }
    }
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emits `bytes` after waiting `delay`.
    pub fn output(mut self, delay: Duration, bytes: &[u8]) -> Self {
        self.output.push((delay, bytes.to_vec()));
        self
    }

    pub fn exit(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    pub fn fail(self) -> Self {
        self.exit(1)
    }

    /// Keeps running after the output until killed.
    pub fn hang(mut self) -> Self {
        self.hang = true;
        self
    }
}

/// An executor that plays back [`Script`]s keyed by sub-command name.
/// Unscripted sub-commands succeed at once without output.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: HashMap<String, Script>,
    files: DashMap<String, Vec<u8>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, command: &str, script: Script) -> Self {
        self.scripts.insert(command.to_string(), script);
        self
    }

    pub fn files(&self) -> BTreeMap<String, Vec<u8>> {
        self.files
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Every spawned argument list, in order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn write_files(&self, binaries: &Binaries) -> Result<(), ExecutorError> {
        for (name, bytes) in binaries {
            check_name(name)?;
            self.files.insert(name.clone(), bytes.clone());
        }
        Ok(())
    }

    fn spawn(&self, args: &[String]) -> Result<ExecProcess, ExecutorError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(args.to_vec());
        }
        let script = args
            .first()
            .and_then(|name| self.scripts.get(name))
            .cloned()
            .unwrap_or_default();
        let (process, io) = ExecProcess::channel(args.join(" "));
        let ProcessIo {
            output,
            exit,
            killed,
        } = io;

        tokio::spawn(async move {
            let Script { output: chunks, code, hang } = script;
            let run = async move {
                for (delay, chunk) in chunks {
                    tokio::time::sleep(delay).await;
                    let _ = output.send(chunk);
                }
                if hang {
                    std::future::pending::<()>().await;
                }
            };
            tokio::select! {
                _ = run => {
                    let _ = exit.send(code);
                }
                _ = killed.cancelled() => {}
            }
        });
        Ok(process)
    }
}
