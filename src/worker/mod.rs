//! Device-side runtime: connects to the server's worker endpoint and serves
//! one [`JobRunner`] per session channel the server opens.

pub mod job;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use titan_comm::{ChannelEvent, CloseFrame, ConnectOptions, Connection, MuxError, RpcHost, Subscription, ws};

use crate::config::WorkerConfig;
use crate::executor::{Executor, ToolExecutor};

pub use job::{JobOptions, JobRunner};

pub const WORKER_PATH: &str = "/worker";

/// Hosts a fresh [`JobRunner`] on every channel the peer opens on `conn`.
pub fn attach(conn: &Connection, executor: Arc<dyn Executor>, options: JobOptions) -> Result<Subscription, MuxError> {
    conn.on(move |event| {
        if let ChannelEvent::Channel(channel) = event {
            let runner = Arc::new(JobRunner::new(Arc::clone(&executor), options.clone()));
            let host = match RpcHost::new(channel.clone(), runner.clone()) {
                Ok(host) => host,
                Err(err) => {
                    warn!(channel = channel.name(), error = %err, "could not host session channel");
                    return;
                }
            };
            debug!(channel = channel.name(), "hosting session channel");
            // the runner's end of the channel goes away once start returns
            tokio::spawn(async move {
                tokio::select! {
                    _ = runner.finished() => host.close(None).await,
                    _ = host.closed() => runner.cancel(),
                }
            });
        }
    })
}

pub struct WorkerRuntime {
    config: WorkerConfig,
    executor: Arc<dyn Executor>,
}

impl WorkerRuntime {
    pub fn new(config: WorkerConfig, executor: Arc<dyn Executor>) -> Self {
        Self { config, executor }
    }

    /// Drives the configured device tool.
    pub fn from_config(config: WorkerConfig) -> Self {
        let executor = ToolExecutor::new(config.tool.clone(), config.tool_args.clone(), config.workdir.clone());
        Self::new(config, Arc::new(executor))
    }

    fn job_options(&self) -> JobOptions {
        JobOptions {
            default_bitstream: self
                .config
                .default_bitstream
                .as_ref()
                .map(|path| path.display().to_string()),
        }
    }

    /// Dials the server. The connection stays paused until [`Self::serve`].
    pub async fn connect(&self) -> Result<Connection> {
        let url = format!("{}{WORKER_PATH}", self.config.host.trim_end_matches('/'));
        let mut options = ConnectOptions::default().with_timeout(self.config.link_timeout);
        if let Some(token) = &self.config.auth_token {
            options = options.with_auth_token(token.clone());
        }
        let conn = ws::connect_paused(&url, &options)
            .await
            .with_context(|| format!("connecting to {url}"))?;
        info!(%url, "connected to server");
        Ok(conn)
    }

    /// Serves sessions until the server drops the connection.
    pub async fn serve(&self, conn: Connection) -> Result<CloseFrame, MuxError> {
        let sessions = attach(&conn, Arc::clone(&self.executor), self.job_options())?;
        conn.resume();
        let frame = conn.closed().await;
        sessions.remove();
        info!(code = frame.code, reason = %frame.reason, "server closed the connection");
        Ok(frame)
    }

    pub async fn run(&self) -> Result<CloseFrame> {
        let conn = self.connect().await?;
        Ok(self.serve(conn).await?)
    }
}
