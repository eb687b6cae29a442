use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use titan_comm::mux::CLOSE_INTERNAL_ERROR;
use titan_comm::Connection;

use super::registry::WorkerRegistry;
use crate::session::{RunOutcome, Session, SessionManager};

pub const FAILED_HEALTHCHECK: &str = "Failed healthcheck";

/// Feeds queued sessions to one connected worker, one at a time.
pub struct WorkerLink {
    conn: Connection,
    name: String,
    id: Uuid,
    manager: Arc<SessionManager>,
    registry: WorkerRegistry,
    cooldown: Duration,
}

impl WorkerLink {
    pub fn new(
        conn: Connection,
        name: &str,
        manager: Arc<SessionManager>,
        registry: WorkerRegistry,
        cooldown: Duration,
    ) -> Self {
        let id = registry.register(name);
        Self {
            conn,
            name: name.to_string(),
            id,
            manager,
            registry,
            cooldown,
        }
    }

    /// Health check first, then queued work until the connection drops.
    pub async fn run(self) {
        info!(worker = %self.name, "running health check");
        if !self.healthcheck().await {
            error!(worker = %self.name, "worker failed health check");
            self.back_off().await;
        } else {
            info!(worker = %self.name, "health check passed");
            self.work().await;
        }
        self.registry.unregister(self.id);
        info!(worker = %self.name, "worker link finished");
    }

    async fn run_session(&self, session: &Session) -> RunOutcome {
        let channel = match self.conn.channel(session.id()) {
            Ok(channel) => channel,
            Err(err) => {
                warn!(worker = %self.name, session = session.id(), error = %err, "could not open session channel");
                return RunOutcome::Retry;
            }
        };
        self.registry.set_session(self.id, Some(session.id()));
        let outcome = session.run(channel).await;
        self.registry.set_session(self.id, None);
        outcome
    }

    async fn healthcheck(&self) -> bool {
        let session = self.manager.healthcheck().session();
        if self.run_session(&session).await == RunOutcome::Finished {
            return true;
        }
        for entry in session.history() {
            let detail: Vec<String> = entry
                .args
                .iter()
                .map(|arg| match arg.to_bytes() {
                    Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    None => format!("{arg:?}"),
                })
                .collect();
            warn!(worker = %self.name, event = %entry.event, detail = %detail.join(" "), "health check output");
        }
        false
    }

    /// Holds a failed worker for the cooldown so it cannot reconnect in a tight loop.
    async fn back_off(&self) {
        if self.conn.is_closed() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.cooldown) => {
                let _ = self.conn.close(CLOSE_INTERNAL_ERROR, FAILED_HEALTHCHECK);
            }
            _ = self.conn.closed() => {}
        }
    }

    async fn work(&self) {
        let mut tasks = self.manager.queue().tasks();
        let abort = tasks.abort_handle();
        let conn = self.conn.clone();
        let watcher = tokio::spawn(async move {
            conn.closed().await;
            abort.cancel();
        });

        while let Some(lease) = tasks.next().await {
            let session = Arc::clone(lease.task());
            match self.run_session(&session).await {
                RunOutcome::Retry => lease.requeue(),
                RunOutcome::Finished | RunOutcome::Exhausted => {
                    self.manager.finish(&session).await;
                    drop(lease);
                }
            }
        }
        watcher.abort();
    }
}
