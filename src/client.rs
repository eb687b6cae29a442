//! Client side of the server's `/client` and `/session/<id>` endpoints.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tokio::sync::mpsc;

use titan_comm::{CloseFrame, ConnectOptions, Connection, RpcClient, Value, ws};

use crate::server::client_api::{CLIENT_PATH, SESSION_PATH_PREFIX};
use crate::session::{Binaries, Command, binaries_value, commands_value, gzip};

const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// A session as reported by `list` and `status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteSession {
    pub id: String,
    pub status: String,
    pub restarts: u32,
    pub created: String,
    /// 1-based backlog position, 0 while running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    pub workers: u32,
}

impl RemoteSession {
    fn from_value(value: &Value) -> Result<Self> {
        let text = |key: &str| {
            value
                .field(key)
                .and_then(|v| v.as_str().map(str::to_owned))
                .ok_or_else(|| anyhow!("session entry without `{key}`"))
        };
        let number = |key: &str| value.field(key).and_then(|v| v.as_f64()).map(|n| n as u32);
        Ok(Self {
            id: text("id")?,
            status: text("status")?,
            restarts: number("restarts").unwrap_or_default(),
            created: text("created")?,
            position: number("position"),
            workers: number("workers").unwrap_or_default(),
        })
    }
}

/// A connected worker as reported by the `workers` property.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteWorker {
    pub name: String,
    pub connected: String,
    pub session: Option<String>,
}

impl RemoteWorker {
    fn from_value(value: &Value) -> Result<Self> {
        let text = |key: &str| value.field(key).and_then(|v| v.as_str().map(str::to_owned));
        Ok(Self {
            name: text("name").ok_or_else(|| anyhow!("worker entry without `name`"))?,
            connected: text("connected").unwrap_or_default(),
            session: text("session"),
        })
    }
}

fn endpoint(host: &str, path: &str) -> String {
    format!("{}{path}", host.trim_end_matches('/'))
}

fn options(token: &str, timeout: Duration) -> ConnectOptions {
    ConnectOptions::default()
        .with_timeout(timeout)
        .with_auth_token(token)
}

pub struct Client {
    rpc: RpcClient,
}

impl Client {
    pub async fn connect(host: &str, token: &str, timeout: Duration) -> Result<Self> {
        let url = endpoint(host, CLIENT_PATH);
        let conn = ws::connect(&url, &options(token, timeout))
            .await
            .with_context(|| format!("connecting to {url}"))?;
        Self::over(&conn)
    }

    /// Drives the API on an already established connection.
    pub fn over(conn: &Connection) -> Result<Self> {
        Ok(Self {
            rpc: RpcClient::new(conn.root().clone())?,
        })
    }

    pub async fn submit(&self, binaries: &Binaries, commands: &[Command], timeout: Option<Duration>) -> Result<String> {
        let mut args = vec![binaries_value(binaries), commands_value(commands)];
        if let Some(timeout) = timeout {
            args.push(Value::from(timeout.as_millis() as f64));
        }
        let id = self.rpc.call(&["submit"], args).await.context("submitting session")?;
        id.as_str()
            .map(str::to_owned)
            .ok_or_else(|| anyhow!("server returned a malformed session id"))
    }

    pub async fn list(&self) -> Result<Vec<RemoteSession>> {
        let listed = self.rpc.call(&["list"], Vec::new()).await.context("listing sessions")?;
        listed
            .to_vec()
            .ok_or_else(|| anyhow!("server returned a malformed session list"))?
            .iter()
            .map(RemoteSession::from_value)
            .collect()
    }

    pub async fn status(&self, id: &str) -> Result<RemoteSession> {
        let status = self.rpc.call(&["status"], vec![Value::from(id)]).await?;
        RemoteSession::from_value(&status)
    }

    pub async fn workers(&self) -> Result<Vec<RemoteWorker>> {
        let workers = self.rpc.get(&["workers"]).await.context("listing workers")?;
        workers
            .to_vec()
            .ok_or_else(|| anyhow!("server returned a malformed worker list"))?
            .iter()
            .map(RemoteWorker::from_value)
            .collect()
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        let removed = self.rpc.call(&["remove"], vec![Value::from(id)]).await?;
        Ok(removed.as_bool().unwrap_or(false))
    }

    pub async fn close(&self) {
        self.rpc.close(Some(CLOSE_GRACE)).await;
    }
}

/// Reads files into a binaries map keyed by file name.
pub async fn read_binaries(paths: &[PathBuf]) -> Result<Binaries> {
    let mut binaries = Binaries::new();
    for path in paths {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("{} has no usable file name", path.display()))?;
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let packed = gzip::compress(&bytes).with_context(|| format!("compressing {}", path.display()))?;
        binaries.insert(name.to_string(), packed);
    }
    Ok(binaries)
}

/// `"load-bitstream top.bit"` -> `["load-bitstream", "top.bit"]`.
pub fn parse_command(raw: &str) -> Command {
    raw.split_whitespace().map(str::to_owned).collect()
}

// -----------------------------------------------------------------------------
// Watching
// -----------------------------------------------------------------------------

/// One message of a session watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// A worker event: `prompt`, `command`, `console`, `error`, `timeout` or `done`.
    Remote {
        event: String,
        timestamp: f64,
        args: Vec<Value>,
    },
    Queued { position: u32, workers: u32 },
    Pending,
    Started,
    Finished,
    Deleted,
}

impl WatchEvent {
    pub fn parse(message: &[Value]) -> Option<Self> {
        let (name, rest) = message.split_first()?;
        let number = |index: usize| rest.get(index).and_then(Value::as_f64);
        Some(match name.as_str()? {
            "queued" => WatchEvent::Queued {
                position: number(0)? as u32,
                workers: number(1)? as u32,
            },
            "pending" => WatchEvent::Pending,
            "started" => WatchEvent::Started,
            "finished" => WatchEvent::Finished,
            "deleted" => WatchEvent::Deleted,
            event => WatchEvent::Remote {
                event: event.to_string(),
                timestamp: number(0)?,
                args: rest.get(1..).map(<[Value]>::to_vec).unwrap_or_default(),
            },
        })
    }
}

pub async fn connect_watch(host: &str, token: &str, id: &str, timeout: Duration) -> Result<Connection> {
    let url = endpoint(host, &format!("{SESSION_PATH_PREFIX}{id}"));
    ws::connect_paused(&url, &options(token, timeout))
        .await
        .with_context(|| format!("connecting to {url}"))
}

/// Hands every watch message to `on_event` in order and returns the frame the
/// server closed the stream with. Resumes a paused connection.
pub async fn watch(conn: &Connection, mut on_event: impl FnMut(WatchEvent)) -> Result<CloseFrame> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = conn.on_message(move |args| {
        let _ = tx.send(args.to_vec());
    })?;
    conn.resume();
    let frame = loop {
        tokio::select! {
            Some(message) = rx.recv() => {
                if let Some(event) = WatchEvent::parse(&message) {
                    on_event(event);
                }
            }
            frame = conn.closed() => break frame,
        }
    };
    while let Ok(message) = rx.try_recv() {
        if let Some(event) = WatchEvent::parse(&message) {
            on_event(event);
        }
    }
    subscription.remove();
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_watch_messages() {
        assert_eq!(
            WatchEvent::parse(&[Value::from("queued"), Value::from(2.0), Value::from(1.0)]),
            Some(WatchEvent::Queued { position: 2, workers: 1 })
        );
        assert_eq!(WatchEvent::parse(&[Value::from("finished")]), Some(WatchEvent::Finished));
        assert_eq!(
            WatchEvent::parse(&[Value::from("console"), Value::from(1000.0), Value::bytes(b"hi".to_vec())]),
            Some(WatchEvent::Remote {
                event: "console".to_string(),
                timestamp: 1000.0,
                args: vec![Value::bytes(b"hi".to_vec())],
            })
        );
        assert_eq!(WatchEvent::parse(&[]), None);
        assert_eq!(WatchEvent::parse(&[Value::Int(3)]), None);
    }

    #[test]
    fn test_remote_session_from_summary() {
        let value = Value::record([
            ("id", Value::from("abc")),
            ("status", Value::from("pending")),
            ("restarts", Value::from(1.0)),
            ("created", Value::from("2026-01-01T00:00:00+00:00")),
            ("position", Value::from(2.0)),
            ("workers", Value::from(3.0)),
        ]);
        let session = RemoteSession::from_value(&value).unwrap();
        assert_eq!(session.position, Some(2));
        assert_eq!(session.workers, 3);

        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["position"], 2);

        assert!(RemoteSession::from_value(&Value::record([("id", Value::from("abc"))])).is_err());
    }

    #[test]
    fn test_remote_worker_from_entry() {
        let busy = Value::record([
            ("name", Value::from("bench-1")),
            ("connected", Value::from("2026-01-01T00:00:00+00:00")),
            ("session", Value::from("abc")),
        ]);
        let worker = RemoteWorker::from_value(&busy).unwrap();
        assert_eq!(worker.session.as_deref(), Some("abc"));

        let idle = Value::record([("name", Value::from("bench-2")), ("session", Value::Null)]);
        assert_eq!(RemoteWorker::from_value(&idle).unwrap().session, None);
        assert!(RemoteWorker::from_value(&Value::record([("session", Value::Null)])).is_err());
    }

    #[test]
    fn test_parse_command_and_endpoint() {
        assert_eq!(parse_command("  console   5 "), vec!["console", "5"]);
        assert_eq!(endpoint("ws://host:8080/", "/client"), "ws://host:8080/client");
    }

    #[tokio::test]
    async fn test_read_binaries_compresses_under_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.bin");
        std::fs::write(&path, b"abc").unwrap();
        let binaries = read_binaries(&[path]).await.unwrap();
        let packed = binaries.get("fw.bin").unwrap().clone();
        assert!(gzip::is_compressed(&packed));
        assert_eq!(gzip::decompress(packed).unwrap(), b"abc".to_vec());
    }
}
