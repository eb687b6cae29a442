use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use titan_comm::{Emitter, EventSink, Owner, RpcEvent, RpcTarget, Subscription, Value, Watchdog};

use crate::executor::{ExecProcess, Executor, ExecutorError};
use crate::session::{Binaries, Command, DEFAULT_TIMEOUT, binaries_from_value, commands_from_value, gzip};

/// Idle window of a `console` command without an explicit length.
pub const DEFAULT_CONSOLE_SECS: f64 = 2.0;
const CONSOLE_ARGS: [&str; 2] = ["console", "-q"];

#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Loaded first when a job does not start with `load-bitstream`.
    pub default_bitstream: Option<String>,
}

/// Runs one session's commands against the executor. Served over RPC as
/// `start(binaries, commands, timeout_ms)` plus the `busy` property.
pub struct JobRunner {
    executor: Arc<dyn Executor>,
    options: JobOptions,
    events: Emitter<RpcEvent>,
    busy: AtomicBool,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl JobRunner {
    pub fn new(executor: Arc<dyn Executor>, options: JobOptions) -> Self {
        Self {
            executor,
            options,
            events: Emitter::new(),
            busy: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Resolves once a `start` call has returned.
    pub async fn finished(&self) {
        self.finished.cancelled().await;
    }

    /// Aborts a running job and kills its processes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn emit(&self, name: &str, args: Vec<Value>) {
        self.events.emit(&RpcEvent {
            name: name.to_string(),
            args,
        });
    }

    fn emit_error(&self, message: String) {
        self.emit("error", vec![Value::from(message)]);
    }

    pub async fn start(&self, binaries: Binaries, commands: Vec<Command>, timeout: Duration) -> Result<()> {
        if self.busy.swap(true, Ordering::SeqCst) {
            bail!("Session already started");
        }
        info!(commands = commands.len(), ?timeout, "job started");
        let outcome = tokio::select! {
            result = self.execute(binaries, commands) => result.map_err(anyhow::Error::from),
            _ = tokio::time::sleep(timeout) => {
                warn!(?timeout, "job timed out");
                self.emit("timeout", Vec::new());
                Err(ExecutorError::SessionTimeout.into())
            }
            _ = self.cancel.cancelled() => Err(ExecutorError::Cancelled.into()),
        };
        match &outcome {
            Ok(()) => {
                info!("job done");
                self.emit("done", Vec::new());
            }
            Err(err) => debug!(error = %err, "job ended early"),
        }
        self.busy.store(false, Ordering::SeqCst);
        self.finished.cancel();
        outcome
    }

    async fn execute(&self, binaries: Binaries, mut commands: Vec<Command>) -> Result<(), ExecutorError> {
        self.executor.write_files(&gzip::decompress_all(binaries)?).await?;
        if let Some(bitstream) = &self.options.default_bitstream {
            let leads_with_load = commands
                .first()
                .and_then(|command| command.first())
                .is_some_and(|name| name == "load-bitstream");
            if !leads_with_load {
                commands.insert(0, vec!["load-bitstream".to_string(), bitstream.clone()]);
            }
        }

        let console = self.executor.spawn(&CONSOLE_ARGS.map(str::to_string))?;
        let gate = ConsoleGate::new(self.events.clone());
        let tasks = Owner::new();
        tasks.spawn(pump_console(console, gate.clone()));

        for command in &commands {
            self.step(command, &gate).await?;
        }
        Ok(())
    }

    async fn step(&self, command: &Command, gate: &ConsoleGate) -> Result<(), ExecutorError> {
        let Some((name, args)) = command.split_first() else {
            self.emit_error("Skipping invalid command \"\"".to_string());
            return Ok(());
        };
        let result = match name.as_str() {
            "console" => {
                let secs = args
                    .first()
                    .and_then(|raw| raw.parse::<f64>().ok())
                    .filter(|secs| secs.is_finite() && *secs > 0.0)
                    .unwrap_or(DEFAULT_CONSOLE_SECS);
                gate.watch(Duration::from_secs_f64(secs)).await;
                Ok(())
            }
            "load-bitstream" => {
                self.prompt(command);
                match self.run_tool(command).await {
                    Ok(()) => self.run_tool(&["set-pll".to_string()]).await,
                    Err(err) => Err(err),
                }
            }
            "bootstrap" => {
                self.prompt(command);
                self.run_tool(command).await
            }
            other => {
                self.emit_error(format!("Skipping invalid command \"{other}\""));
                Ok(())
            }
        };
        if let Err(err) = &result {
            warn!(command = %name, error = %err, "command failed");
            self.emit_error(format!("Error while running command \"{name}\""));
        }
        result
    }

    fn prompt(&self, command: &Command) {
        self.emit("prompt", vec![Value::from(command.join(" "))]);
    }

    /// Streams a tool run's output as `command` events.
    async fn run_tool(&self, args: &[String]) -> Result<(), ExecutorError> {
        let mut process = self.executor.spawn(args)?;
        while let Some(chunk) = process.output().await {
            self.emit("command", vec![Value::bytes(chunk)]);
        }
        process.wait().await
    }

    fn parse_start(args: Vec<Value>) -> Result<(Binaries, Vec<Command>, Duration)> {
        let mut args = args.into_iter();
        let binaries = args
            .next()
            .as_ref()
            .and_then(binaries_from_value)
            .ok_or_else(|| anyhow!("start expects a map of binaries"))?;
        let commands = args
            .next()
            .as_ref()
            .and_then(commands_from_value)
            .ok_or_else(|| anyhow!("start expects a list of commands"))?;
        let timeout = args
            .next()
            .and_then(|ms| ms.as_f64())
            .filter(|ms| ms.is_finite() && *ms > 0.0)
            .map(|ms| Duration::from_millis(ms as u64))
            .unwrap_or(DEFAULT_TIMEOUT);
        Ok((binaries, commands, timeout))
    }
}

#[async_trait]
impl RpcTarget for JobRunner {
    async fn call(&self, path: &[String], args: Vec<Value>) -> Result<Value> {
        match path {
            [method] if method == "start" => {
                let started = match Self::parse_start(args) {
                    Ok((binaries, commands, timeout)) => self.start(binaries, commands, timeout).await,
                    Err(err) => {
                        self.finished.cancel();
                        Err(err)
                    }
                };
                started.map(|()| Value::Undefined)
            }
            _ => bail!("Unknown method {}", path.join(".")),
        }
    }

    async fn get(&self, path: &[String]) -> Result<Value> {
        match path {
            [property] if property == "busy" => Ok(Value::Bool(self.is_busy())),
            _ => bail!("Unknown property {}", path.join(".")),
        }
    }

    fn subscribe(&self, event: &str, sink: EventSink) -> Option<Subscription> {
        let name = event.to_string();
        Some(self.events.on(move |event: &RpcEvent| {
            if event.name == name {
                sink(event.args.clone());
            }
        }))
    }
}

// -----------------------------------------------------------------------------
// Console
// -----------------------------------------------------------------------------

async fn pump_console(mut console: ExecProcess, gate: ConsoleGate) {
    while let Some(chunk) = console.output().await {
        gate.feed(chunk);
    }
    debug!("console output ended");
}

#[derive(Default)]
struct GateState {
    window: Option<Watchdog>,
    backlog: Vec<u8>,
}

/// Holds console output back between `console` commands. Output seen while a
/// window is open is emitted at once and keeps the window alive.
#[derive(Clone)]
struct ConsoleGate {
    state: Arc<Mutex<GateState>>,
    events: Emitter<RpcEvent>,
}

impl ConsoleGate {
    fn new(events: Emitter<RpcEvent>) -> Self {
        Self {
            state: Arc::new(Mutex::new(GateState::default())),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, bytes: Vec<u8>) {
        self.events.emit(&RpcEvent {
            name: "console".to_string(),
            args: vec![Value::bytes(bytes)],
        });
    }

    fn feed(&self, chunk: Vec<u8>) {
        let mut state = self.lock();
        match &state.window {
            Some(window) => {
                window.tick();
                drop(state);
                self.emit(chunk);
            }
            None => state.backlog.extend(chunk),
        }
    }

    /// Opens a window, flushes the backlog and waits until the console has
    /// been quiet for `idle`.
    async fn watch(&self, idle: Duration) {
        let window = Watchdog::new(idle);
        let backlog = {
            let mut state = self.lock();
            window.tick();
            state.window = Some(window.clone());
            std::mem::take(&mut state.backlog)
        };
        if !backlog.is_empty() {
            self.emit(backlog);
        }
        window.alerted().await;
        self.lock().window = None;
    }
}
