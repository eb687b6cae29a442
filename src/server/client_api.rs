use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tracing::{debug, warn};

use titan_comm::mux::{CLOSE_INTERNAL_ERROR, CLOSE_NORMAL};
use titan_comm::{Connection, RpcHost, RpcTarget, Value};

use super::registry::WorkerRegistry;
use crate::session::{
    Binaries, Session, SessionEvent, SessionManager, SessionStatus, binaries_from_value, commands_from_value,
};

pub const CLIENT_PATH: &str = "/client";
pub const SESSION_PATH_PREFIX: &str = "/session/";

/// Session operations offered to one authenticated user.
pub struct ClientApi {
    user: String,
    manager: Arc<SessionManager>,
    registry: WorkerRegistry,
}

impl ClientApi {
    pub fn new(user: String, manager: Arc<SessionManager>, registry: WorkerRegistry) -> Self {
        Self {
            user,
            manager,
            registry,
        }
    }

    fn id_arg(args: &[Value]) -> Result<&str> {
        args.first()
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("expected a session id"))
    }

    async fn submit(&self, args: Vec<Value>) -> Result<Value> {
        let mut args = args.into_iter();
        let binaries = match args.next() {
            None | Some(Value::Undefined) | Some(Value::Null) => Binaries::new(),
            Some(value) => binaries_from_value(&value).ok_or_else(|| anyhow!("binaries must map names to buffers"))?,
        };
        let commands = match args.next() {
            None | Some(Value::Undefined) | Some(Value::Null) => Vec::new(),
            Some(value) => commands_from_value(&value).ok_or_else(|| anyhow!("commands must be lists of strings"))?,
        };
        let timeout = args
            .next()
            .and_then(|ms| ms.as_f64())
            .filter(|ms| ms.is_finite() && *ms > 0.0)
            .map(|ms| Duration::from_millis(ms as u64));
        let session = self.manager.submit(&self.user, binaries, commands, timeout).await?;
        Ok(Value::from(session.id()))
    }
}

#[async_trait]
impl RpcTarget for ClientApi {
    async fn call(&self, path: &[String], args: Vec<Value>) -> Result<Value> {
        let [method] = path else {
            bail!("Unknown method {}", path.join("."));
        };
        match method.as_str() {
            "submit" => self.submit(args).await,
            "list" => {
                let sessions = self.manager.list(&self.user).await?;
                Ok(Value::seq(sessions.iter().map(|summary| summary.to_value()).collect()))
            }
            "status" => {
                let id = Self::id_arg(&args)?;
                match self.manager.get(&self.user, id).await? {
                    Some(session) => Ok(self.manager.summary(&session).to_value()),
                    None => bail!("Unknown session {id}"),
                }
            }
            "remove" => {
                let id = Self::id_arg(&args)?;
                Ok(Value::Bool(self.manager.remove(&self.user, id).await?))
            }
            other => bail!("Unknown method {other}"),
        }
    }

    async fn get(&self, path: &[String]) -> Result<Value> {
        match path {
            [property] if property == "user" => Ok(Value::from(self.user.as_str())),
            [property] if property == "workers" => Ok(Value::seq(
                self.registry.list().iter().map(|worker| worker.to_value()).collect(),
            )),
            [property] if property == "queue" => {
                let snapshot = self.manager.queue().snapshot();
                Ok(Value::record([
                    ("pending", Value::from(snapshot.pending as f64)),
                    ("running", Value::from(snapshot.running as f64)),
                    ("workers", Value::from(snapshot.workers as f64)),
                ]))
            }
            _ => bail!("Unknown property {}", path.join(".")),
        }
    }
}

/// Serves a [`ClientApi`] on the connection root until the client leaves.
pub async fn serve_client(conn: Connection, api: ClientApi) {
    let user = api.user.clone();
    match RpcHost::new(conn.root().clone(), Arc::new(api)) {
        Ok(host) => {
            conn.resume();
            debug!(%user, "client connected");
            host.closed().await;
            debug!(%user, "client disconnected");
        }
        Err(err) => {
            warn!(%user, error = %err, "could not serve client");
            let _ = conn.close(CLOSE_INTERNAL_ERROR, "Client API unavailable");
            conn.resume();
        }
    }
}

/// The plain message a watcher receives for `event`, and the close reason if
/// the stream ends with it.
pub fn watch_message(event: &SessionEvent) -> (Vec<Value>, Option<&'static str>) {
    match event {
        SessionEvent::Remote(entry) => (entry.to_message(), None),
        SessionEvent::Status(SessionStatus::Running) => (vec![Value::from("started")], None),
        SessionEvent::Status(SessionStatus::Pending) => (vec![Value::from("pending")], None),
        SessionEvent::Status(SessionStatus::Done) => (vec![Value::from("finished")], Some("Session finished")),
        SessionEvent::Status(SessionStatus::Deleted) | SessionEvent::Deleted => {
            (vec![Value::from("deleted")], Some("Session deleted"))
        }
        SessionEvent::Queued { position, workers } => (
            vec![
                Value::from("queued"),
                Value::from(*position as f64),
                Value::from(*workers as f64),
            ],
            None,
        ),
    }
}

/// Replays a session's history to a watcher, follows it live and closes the
/// connection normally once the session is finished or deleted.
pub async fn stream_session(conn: Connection, session: Arc<Session>) {
    let mut events = session.subscribe();
    conn.resume();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    let _ = conn.close(CLOSE_NORMAL, "Session deleted");
                    break;
                };
                let (message, end) = watch_message(&event);
                if conn.send(message).is_err() {
                    break;
                }
                if let Some(reason) = end {
                    let _ = conn.close(CLOSE_NORMAL, reason);
                    break;
                }
            }
            _ = conn.closed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::InMemorySessionStore;
    use crate::session::{ManagerOptions, binaries_value, commands_value};
    use titan_comm::{ConnectOptions, RpcClient};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn connect(user: &str, manager: &Arc<SessionManager>) -> RpcClient {
        connect_with(user, manager, WorkerRegistry::new())
    }

    fn connect_with(user: &str, manager: &Arc<SessionManager>, registry: WorkerRegistry) -> RpcClient {
        let (client, server) = Connection::pair_paused(&ConnectOptions::default());
        let api = ClientApi::new(user.to_string(), Arc::clone(manager), registry);
        tokio::spawn(serve_client(server, api));
        RpcClient::new(client.root().clone()).unwrap()
    }

    fn job() -> Vec<Value> {
        let mut binaries = Binaries::new();
        binaries.insert("fw.bin".to_string(), vec![7]);
        let commands = vec![vec!["bootstrap".to_string(), "fw.bin".to_string()]];
        vec![binaries_value(&binaries), commands_value(&commands)]
    }

    #[tokio::test]
    async fn test_submit_status_list_remove() {
        let manager = SessionManager::new(InMemorySessionStore::new(), ManagerOptions::default());
        let alice = connect("alice", &manager);

        let id = timeout(WAIT, alice.call(&["submit"], job())).await.unwrap().unwrap();
        let id = id.as_str().unwrap().to_string();

        let status = timeout(WAIT, alice.call(&["status"], vec![Value::from(id.as_str())]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.field("status"), Some(Value::from("pending")));
        assert_eq!(status.field("position"), Some(Value::from(1.0)));

        let listed = timeout(WAIT, alice.call(&["list"], Vec::new())).await.unwrap().unwrap();
        assert_eq!(listed.to_vec().unwrap().len(), 1);

        let removed = timeout(WAIT, alice.call(&["remove"], vec![Value::from(id.as_str())]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(removed, Value::Bool(true));
        assert_eq!(manager.queue().snapshot().pending, 0);
    }

    #[tokio::test]
    async fn test_other_users_cannot_see_a_session() {
        let manager = SessionManager::new(InMemorySessionStore::new(), ManagerOptions::default());
        let alice = connect("alice", &manager);
        let mallory = connect("mallory", &manager);

        let id = timeout(WAIT, alice.call(&["submit"], job())).await.unwrap().unwrap();
        let denied = timeout(WAIT, mallory.call(&["status"], vec![id.clone()])).await.unwrap();
        assert!(denied.is_err());
        let removed = timeout(WAIT, mallory.call(&["remove"], vec![id])).await.unwrap().unwrap();
        assert_eq!(removed, Value::Bool(false));
        assert_eq!(timeout(WAIT, mallory.get(&["user"])).await.unwrap().unwrap(), Value::from("mallory"));
    }

    #[tokio::test]
    async fn test_workers_lists_each_worker_and_its_session() {
        let manager = SessionManager::new(InMemorySessionStore::new(), ManagerOptions::default());
        let registry = WorkerRegistry::new();
        let busy = registry.register("bench-1");
        registry.register("bench-2");
        registry.set_session(busy, Some("s-1"));
        let alice = connect_with("alice", &manager, registry);

        let workers = timeout(WAIT, alice.get(&["workers"])).await.unwrap().unwrap();
        let workers = workers.to_vec().unwrap();
        assert_eq!(workers.len(), 2);
        let session_of = |name: &str| {
            workers
                .iter()
                .find(|worker| worker.field("name") == Some(Value::from(name)))
                .and_then(|worker| worker.field("session"))
        };
        assert_eq!(session_of("bench-1"), Some(Value::from("s-1")));
        assert_eq!(session_of("bench-2"), Some(Value::Null));
    }

    #[tokio::test]
    async fn test_bad_submissions_are_refused() {
        let manager = SessionManager::new(InMemorySessionStore::new(), ManagerOptions::default());
        let alice = connect("alice", &manager);
        let result = timeout(WAIT, alice.call(&["submit"], vec![Value::from("not a map")]))
            .await
            .unwrap();
        assert!(result.is_err());
        assert_eq!(manager.queue().snapshot().pending, 0);
    }

    #[tokio::test]
    async fn test_watchers_get_history_then_the_end() {
        let manager = SessionManager::new(InMemorySessionStore::new(), ManagerOptions::default());
        let mut binaries = Binaries::new();
        binaries.insert("fw.bin".to_string(), vec![1]);
        let session = manager
            .submit("alice", binaries, vec![vec!["console".to_string()]], None)
            .await
            .unwrap();
        session.record_event("prompt", vec![Value::from("console")]).await;

        let (watcher, server) = Connection::pair(&ConnectOptions::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        watcher
            .on_message(move |args| {
                let name = args.first().and_then(Value::as_str).map(str::to_owned);
                if name.as_deref() != Some("queued") {
                    let _ = tx.send(name);
                }
            })
            .unwrap();
        tokio::spawn(stream_session(server, Arc::clone(&session)));

        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap().as_deref(), Some("prompt"));
        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap().as_deref(), Some("pending"));

        session.set_status(SessionStatus::Done).await;
        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap().as_deref(), Some("finished"));
        let frame = timeout(WAIT, watcher.closed()).await.unwrap();
        assert_eq!(frame.code, CLOSE_NORMAL);
        assert_eq!(frame.reason, "Session finished");
    }
}
