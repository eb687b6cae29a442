//! Server-side job sessions: status, history and the retry state machine.

pub mod gzip;
pub mod healthcheck;
pub mod manager;
pub mod store;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use titan_comm::mux::CLOSE_TIMEOUT;
use titan_comm::{Channel, RpcClient, Value};

use crate::logger::SESSION_TARGET;
use store::{SessionStore, StoreError};

pub use healthcheck::Healthcheck;
pub use manager::{ManagerOptions, SessionManager, SessionSummary};

/// Consecutive unexplained failures after which a session is given up.
pub const MAX_RESTARTS: u32 = 5;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
/// Extra time the worker gets to wind down after the session timeout.
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Events a worker emits while running a session.
pub const REMOTE_EVENTS: [&str; 6] = ["prompt", "command", "console", "error", "timeout", "done"];

pub type Binaries = BTreeMap<String, Vec<u8>>;
pub type Command = Vec<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Running,
    Done,
    Deleted,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Done => "done",
            SessionStatus::Deleted => "deleted",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(SessionStatus::Pending),
            "running" => Some(SessionStatus::Running),
            "done" => Some(SessionStatus::Done),
            "deleted" => Some(SessionStatus::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One remote event as it was observed.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub args: Vec<Value>,
}

/// What a session subscriber sees, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Remote(HistoryEntry),
    Status(SessionStatus),
    Queued { position: usize, workers: usize },
    Deleted,
}

/// Persistent part of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub owner: String,
    pub binaries: Binaries,
    pub commands: Vec<Command>,
    pub history: Vec<HistoryEntry>,
    pub status: SessionStatus,
    pub restarts: u32,
    pub timeout: Duration,
    pub created: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(id: String, owner: String, binaries: Binaries, commands: Vec<Command>, timeout: Duration) -> Self {
        Self {
            id,
            owner,
            binaries,
            commands,
            history: Vec::new(),
            status: SessionStatus::Pending,
            restarts: 0,
            timeout,
            created: Utc::now(),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::record([
            ("id", Value::from(self.id.as_str())),
            ("owner", Value::from(self.owner.as_str())),
            ("binaries", binaries_value(&self.binaries)),
            ("commands", commands_value(&self.commands)),
            ("history", Value::seq(self.history.iter().map(HistoryEntry::to_value).collect())),
            ("status", Value::from(self.status.as_str())),
            ("restarts", Value::from(self.restarts as f64)),
            ("timeout", Value::from(self.timeout.as_millis() as f64)),
            ("created", Value::from(self.created.timestamp_millis() as f64)),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self, StoreError> {
        let status = text(value, "status")?;
        Ok(Self {
            id: text(value, "id")?,
            owner: text(value, "owner")?,
            binaries: binaries_from_value(&field(value, "binaries")?)
                .ok_or_else(|| corrupt("binaries"))?,
            commands: commands_from_value(&field(value, "commands")?)
                .ok_or_else(|| corrupt("commands"))?,
            history: field(value, "history")?
                .to_vec()
                .ok_or_else(|| corrupt("history"))?
                .iter()
                .map(HistoryEntry::from_value)
                .collect::<Result<_, _>>()?,
            status: SessionStatus::parse(&status).ok_or_else(|| corrupt("status"))?,
            restarts: number(value, "restarts")? as u32,
            timeout: Duration::from_millis(number(value, "timeout")? as u64),
            created: timestamp(number(value, "created")?)?,
        })
    }
}

impl HistoryEntry {
    pub fn new(event: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            event: event.into(),
            timestamp: Utc::now(),
            args,
        }
    }

    fn to_value(&self) -> Value {
        Value::record([
            ("event", Value::from(self.event.as_str())),
            ("timestamp", Value::from(self.timestamp.timestamp_millis() as f64)),
            ("args", Value::seq(self.args.clone())),
        ])
    }

    fn from_value(value: &Value) -> Result<Self, StoreError> {
        Ok(Self {
            event: text(value, "event")?,
            timestamp: timestamp(number(value, "timestamp")?)?,
            args: field(value, "args")?.to_vec().ok_or_else(|| corrupt("args"))?,
        })
    }

    /// `[event, millis, ...args]`, the shape streamed to watchers.
    pub fn to_message(&self) -> Vec<Value> {
        let mut message = Vec::with_capacity(self.args.len() + 2);
        message.push(Value::from(self.event.as_str()));
        message.push(Value::from(self.timestamp.timestamp_millis() as f64));
        message.extend(self.args.iter().cloned());
        message
    }
}

fn corrupt(what: &str) -> StoreError {
    StoreError::Corrupt(format!("bad `{what}` field"))
}

fn field(value: &Value, key: &str) -> Result<Value, StoreError> {
    value.field(key).ok_or_else(|| StoreError::Corrupt(format!("missing `{key}` field")))
}

fn text(value: &Value, key: &str) -> Result<String, StoreError> {
    field(value, key)?.as_str().map(str::to_owned).ok_or_else(|| corrupt(key))
}

fn number(value: &Value, key: &str) -> Result<f64, StoreError> {
    field(value, key)?
        .as_f64()
        .filter(|n| n.is_finite() && *n >= 0.0)
        .ok_or_else(|| corrupt(key))
}

fn timestamp(millis: f64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis as i64).ok_or_else(|| corrupt("timestamp"))
}

pub fn binaries_value(binaries: &Binaries) -> Value {
    Value::map(
        binaries
            .iter()
            .map(|(name, bytes)| (Value::from(name.as_str()), Value::bytes(bytes.clone())))
            .collect(),
    )
}

pub fn binaries_from_value(value: &Value) -> Option<Binaries> {
    value
        .to_entries()?
        .into_iter()
        .map(|(name, bytes)| Some((name.as_str()?.to_string(), bytes.to_bytes()?)))
        .collect()
}

pub fn commands_value(commands: &[Command]) -> Value {
    Value::seq(
        commands
            .iter()
            .map(|command| Value::seq(command.iter().map(|part| Value::from(part.as_str())).collect()))
            .collect(),
    )
}

pub fn commands_from_value(value: &Value) -> Option<Vec<Command>> {
    value
        .to_vec()?
        .iter()
        .map(|command| {
            command
                .to_vec()?
                .iter()
                .map(|part| part.as_str().map(str::to_owned))
                .collect()
        })
        .collect()
}

// -----------------------------------------------------------------------------
// Session
// -----------------------------------------------------------------------------

/// How one attempt at running a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The worker reported `done` or `timeout`.
    Finished,
    /// Unexplained failure; the session is pending again and should be requeued.
    Retry,
    /// Unexplained failure number [`MAX_RESTARTS`]; the session is done.
    Exhausted,
}

struct SessionState {
    record: SessionRecord,
    subscribers: Vec<mpsc::UnboundedSender<SessionEvent>>,
}

impl SessionState {
    fn publish(&mut self, event: SessionEvent) {
        self.subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

pub struct Session {
    id: String,
    temporary: bool,
    store: Option<Arc<dyn SessionStore>>,
    state: Mutex<SessionState>,
    save_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("temporary", &self.temporary)
            .finish()
    }
}

impl Session {
    /// A session persisted to `store` on every change.
    pub fn new(record: SessionRecord, store: Arc<dyn SessionStore>) -> Arc<Self> {
        Self::build(record, Some(store), false)
    }

    /// A session that is never persisted and never counts restarts.
    pub fn temporary(record: SessionRecord) -> Arc<Self> {
        Self::build(record, None, true)
    }

    fn build(record: SessionRecord, store: Option<Arc<dyn SessionStore>>, temporary: bool) -> Arc<Self> {
        Arc::new(Self {
            id: record.id.clone(),
            temporary,
            store,
            state: Mutex::new(SessionState {
                record,
                subscribers: Vec::new(),
            }),
            save_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn owner(&self) -> String {
        self.lock().record.owner.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().record.status
    }

    pub fn restarts(&self) -> u32 {
        self.lock().record.restarts
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.lock().record.history.clone()
    }

    pub fn record(&self) -> SessionRecord {
        self.lock().record.clone()
    }

    /// Replays the history and current status, then follows live events.
    /// The stream ends when the session is deleted.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        for entry in &state.record.history {
            let _ = tx.send(SessionEvent::Remote(entry.clone()));
        }
        match state.record.status {
            SessionStatus::Deleted => {
                let _ = tx.send(SessionEvent::Deleted);
                return rx;
            }
            status => {
                let _ = tx.send(SessionEvent::Status(status));
            }
        }
        state.subscribers.push(tx);
        rx
    }

    /// Appends a remote event to the history and tells subscribers.
    /// Ignored once the session is deleted.
    pub async fn record_event(&self, event: &str, args: Vec<Value>) {
        let entry = HistoryEntry::new(event, args);
        debug!(session = %self.id, event, "remote event");
        {
            let mut state = self.lock();
            if state.record.status == SessionStatus::Deleted {
                return;
            }
            state.record.history.push(entry.clone());
            state.publish(SessionEvent::Remote(entry));
        }
        self.persist().await;
    }

    /// Deleted is terminal: use [`Session::delete`] to get there, nothing leaves it.
    pub async fn set_status(&self, status: SessionStatus) {
        {
            let mut state = self.lock();
            if state.record.status == status || state.record.status == SessionStatus::Deleted {
                return;
            }
            state.record.status = status;
            state.publish(SessionEvent::Status(status));
        }
        info!(target: SESSION_TARGET, session = %self.id, status = status.as_str(), "status changed");
        self.persist().await;
    }

    /// Reports the backlog position. Not persisted.
    pub fn notify_queued(&self, position: usize, workers: usize) {
        self.lock().publish(SessionEvent::Queued { position, workers });
    }

    /// Marks the session deleted, ends every subscription and drops the stored record.
    pub async fn delete(&self) {
        {
            let mut state = self.lock();
            if state.record.status == SessionStatus::Deleted {
                return;
            }
            state.record.status = SessionStatus::Deleted;
            state.record.binaries.clear();
            state.publish(SessionEvent::Deleted);
            state.subscribers.clear();
        }
        info!(target: SESSION_TARGET, session = %self.id, status = "deleted", "status changed");
        self.persist().await;
    }

    /// Writes the latest state. Concurrent calls are serialized and the last
    /// write always carries the newest snapshot.
    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let _saving = self.save_lock.lock().await;
        let snapshot = self.record();
        let result = match snapshot.status {
            SessionStatus::Deleted => store.remove(&snapshot.id).await,
            _ => store.save(&snapshot).await,
        };
        if let Err(err) = result {
            warn!(session = %self.id, error = %err, "failed to persist session");
        }
    }

    /// Runs one attempt on a worker over `channel`.
    /// A session deleted before the attempt starts is not run.
    pub async fn run(&self, channel: Channel) -> RunOutcome {
        if self.status() == SessionStatus::Deleted {
            debug!(session = %self.id, "session was deleted before it started");
            return RunOutcome::Finished;
        }
        self.set_status(SessionStatus::Running).await;
        let (binaries, commands, timeout) = {
            let state = self.lock();
            (
                binaries_value(&state.record.binaries),
                commands_value(&state.record.commands),
                state.record.timeout,
            )
        };

        let explained = match RpcClient::new(channel.clone()) {
            Ok(client) => self.drive(&channel, client, binaries, commands, timeout).await,
            Err(err) => {
                warn!(session = %self.id, error = %err, "could not open session channel");
                false
            }
        };
        self.settle(explained).await
    }

    /// Starts the job and records remote events until the channel closes.
    /// Returns whether the worker explained the end of the run.
    async fn drive(
        &self,
        channel: &Channel,
        client: RpcClient,
        binaries: Value,
        commands: Value,
        timeout: Duration,
    ) -> bool {
        let (tx, mut events) = mpsc::unbounded_channel::<(String, Vec<Value>)>();
        for name in REMOTE_EVENTS {
            let tx = tx.clone();
            if let Err(err) = client.on(name, move |args| {
                let _ = tx.send((name.to_string(), args.to_vec()));
            }) {
                warn!(session = %self.id, error = %err, "could not subscribe to worker events");
                return false;
            }
        }
        drop(tx);

        let grace = CLOSE_GRACE.min(timeout);
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let start = {
            let client = client.clone();
            let id = self.id.clone();
            async move {
                let started = client
                    .call(&["start"], vec![binaries, commands, Value::from(timeout_ms)])
                    .await;
                if let Err(err) = started {
                    debug!(session = %id, error = %err, "start returned an error");
                }
                client.close(Some(grace)).await;
            }
        };
        let deadline = tokio::time::sleep(timeout + grace);
        tokio::pin!(start);
        tokio::pin!(deadline);

        let mut explained = false;
        let mut started = false;
        loop {
            tokio::select! {
                Some((event, args)) = events.recv() => {
                    explained |= event == "done" || event == "timeout";
                    self.record_event(&event, args).await;
                }
                _ = &mut start, if !started => started = true,
                _ = &mut deadline => {
                    warn!(session = %self.id, "session overran its deadline, closing channel");
                    let _ = channel.close(CLOSE_TIMEOUT, "Session timed out");
                    break;
                }
                _ = channel.closed() => break,
            }
        }

        while let Ok((event, args)) = events.try_recv() {
            explained |= event == "done" || event == "timeout";
            self.record_event(&event, args).await;
        }
        explained
    }

    async fn settle(&self, explained: bool) -> RunOutcome {
        if self.status() == SessionStatus::Deleted {
            return RunOutcome::Finished;
        }
        if explained {
            self.lock().record.binaries.clear();
            self.set_status(SessionStatus::Done).await;
            return RunOutcome::Finished;
        }

        let restarts = if self.temporary {
            0
        } else {
            let mut state = self.lock();
            state.record.restarts += 1;
            state.record.restarts
        };
        if restarts >= MAX_RESTARTS {
            warn!(target: SESSION_TARGET, session = %self.id, restarts, "giving up on session");
            self.record_event(
                "error",
                vec![Value::from(format!("Session failed {restarts} times. Giving up."))],
            )
            .await;
            self.lock().record.binaries.clear();
            self.set_status(SessionStatus::Done).await;
            return RunOutcome::Exhausted;
        }

        info!(target: SESSION_TARGET, session = %self.id, restarts, "session failed, requeueing");
        self.record_event("error", vec![Value::from("Session error. Restarting.")])
            .await;
        self.set_status(SessionStatus::Pending).await;
        RunOutcome::Retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ScriptedExecutor, Script};
    use crate::worker::{self, JobOptions};
    use store::InMemorySessionStore;
    use titan_comm::{ConnectOptions, Connection};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn record(commands: &[&[&str]], timeout: Duration) -> SessionRecord {
        let mut binaries = Binaries::new();
        binaries.insert("fw.bin".to_string(), vec![1, 2, 3]);
        SessionRecord::new(
            "s-1".to_string(),
            "alice".to_string(),
            binaries,
            commands
                .iter()
                .map(|command| command.iter().map(|part| part.to_string()).collect())
                .collect(),
            timeout,
        )
    }

    fn worker_pair(executor: ScriptedExecutor) -> (Connection, Connection, Arc<ScriptedExecutor>) {
        let (server, device) = Connection::pair(&ConnectOptions::default());
        let executor = Arc::new(executor);
        worker::attach(&device, executor.clone(), JobOptions::default()).unwrap();
        (server, device, executor)
    }

    fn events(history: &[HistoryEntry]) -> Vec<&str> {
        history.iter().map(|entry| entry.event.as_str()).collect()
    }

    #[tokio::test]
    async fn test_successful_run_finishes() {
        let store = InMemorySessionStore::new();
        let session = Session::new(
            record(&[&["load-bitstream", "fw.bin"], &["console", "0.2"]], Duration::from_secs(10)),
            store.clone(),
        );
        let executor = ScriptedExecutor::new()
            .script("console", Script::new().output(Duration::from_millis(20), b"hello\n").hang());
        let (server, _device, executor) = worker_pair(executor);

        let channel = server.channel(session.id()).unwrap();
        let outcome = timeout(WAIT, session.run(channel)).await.unwrap();
        assert_eq!(outcome, RunOutcome::Finished);
        assert_eq!(session.status(), SessionStatus::Done);
        assert_eq!(events(&session.history()), vec!["prompt", "console", "done"]);
        assert!(session.record().binaries.is_empty());
        assert_eq!(executor.files().get("fw.bin"), Some(&vec![1, 2, 3]));

        let stored = store.load("s-1").await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Done);
        assert_eq!(stored.history.len(), 3);
    }

    #[tokio::test]
    async fn test_unexplained_close_requeues() {
        let session = Session::new(
            record(&[&["bootstrap", "fw.bin"]], Duration::from_secs(10)),
            InMemorySessionStore::new(),
        );
        let executor = ScriptedExecutor::new().script("bootstrap", Script::new().fail());
        let (server, _device, _executor) = worker_pair(executor);

        let outcome = timeout(WAIT, session.run(server.channel(session.id()).unwrap()))
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Retry);
        assert_eq!(session.status(), SessionStatus::Pending);
        assert_eq!(session.restarts(), 1);
        let history = session.history();
        let last = history.last().unwrap();
        assert_eq!(last.event, "error");
        assert_eq!(last.args, vec![Value::from("Session error. Restarting.")]);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_restarts() {
        let session = Session::new(
            record(&[&["bootstrap", "fw.bin"]], Duration::from_secs(10)),
            InMemorySessionStore::new(),
        );
        for attempt in 1..=MAX_RESTARTS {
            let (server, device) = Connection::pair(&ConnectOptions::default());
            // the worker drops mid-run
            let channel = server.channel(session.id()).unwrap();
            device.close(1006, "gone").unwrap();
            let outcome = timeout(WAIT, session.run(channel)).await.unwrap();
            if attempt < MAX_RESTARTS {
                assert_eq!(outcome, RunOutcome::Retry);
            } else {
                assert_eq!(outcome, RunOutcome::Exhausted);
            }
        }
        assert_eq!(session.status(), SessionStatus::Done);
        assert_eq!(session.restarts(), MAX_RESTARTS);
        let history = session.history();
        assert_eq!(
            history.last().unwrap().args,
            vec![Value::from("Session failed 5 times. Giving up.")]
        );
    }

    #[tokio::test]
    async fn test_temporary_sessions_do_not_count_restarts() {
        let session = Session::temporary(record(&[], Duration::from_secs(10)));
        for _ in 0..MAX_RESTARTS + 1 {
            let (server, device) = Connection::pair(&ConnectOptions::default());
            let channel = server.channel(session.id()).unwrap();
            device.close(1006, "gone").unwrap();
            assert_eq!(timeout(WAIT, session.run(channel)).await.unwrap(), RunOutcome::Retry);
        }
        assert_eq!(session.restarts(), 0);
    }

    #[tokio::test]
    async fn test_worker_timeout_counts_as_explained() {
        let session = Session::new(
            record(&[&["console", "5"]], Duration::from_millis(300)),
            InMemorySessionStore::new(),
        );
        let executor = ScriptedExecutor::new().script(
            "console",
            Script::new().output(Duration::from_millis(50), b"tick").hang(),
        );
        let (server, _device, _executor) = worker_pair(executor);

        let outcome = timeout(WAIT, session.run(server.channel(session.id()).unwrap()))
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Finished);
        assert!(events(&session.history()).contains(&"timeout"));
    }

    #[tokio::test]
    async fn test_subscribers_get_history_then_live_events() {
        let session = Session::new(record(&[], DEFAULT_TIMEOUT), InMemorySessionStore::new());
        session.record_event("prompt", vec![Value::from("load-bitstream fw.bin")]).await;

        let mut rx = session.subscribe();
        match rx.recv().await.unwrap() {
            SessionEvent::Remote(entry) => assert_eq!(entry.event, "prompt"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(rx.recv().await.unwrap(), SessionEvent::Status(SessionStatus::Pending));

        session.notify_queued(2, 1);
        session.set_status(SessionStatus::Running).await;
        assert_eq!(rx.recv().await.unwrap(), SessionEvent::Queued { position: 2, workers: 1 });
        assert_eq!(rx.recv().await.unwrap(), SessionEvent::Status(SessionStatus::Running));

        session.delete().await;
        assert_eq!(rx.recv().await.unwrap(), SessionEvent::Deleted);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_deleted_session_is_not_run_or_saved_again() {
        let store = InMemorySessionStore::new();
        let session = Session::new(record(&[&["console", "0.2"]], DEFAULT_TIMEOUT), store.clone());
        session.set_status(SessionStatus::Pending).await;
        session.delete().await;

        let executor = ScriptedExecutor::new()
            .script("console", Script::new().output(Duration::from_millis(10), b"late").hang());
        let (server, _device, executor) = worker_pair(executor);
        let outcome = timeout(WAIT, session.run(server.channel(session.id()).unwrap()))
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Finished);
        assert_eq!(session.status(), SessionStatus::Deleted);
        assert!(session.history().is_empty());
        assert!(executor.files().is_empty());
        assert!(store.load("s-1").await.unwrap().is_none());

        session.set_status(SessionStatus::Running).await;
        session.record_event("console", vec![Value::from("x")]).await;
        assert_eq!(session.status(), SessionStatus::Deleted);
        assert!(session.history().is_empty());
        assert!(store.load("s-1").await.unwrap().is_none());
    }

    #[test]
    fn test_record_survives_value_conversion() {
        let mut original = record(&[&["console", "2"]], Duration::from_millis(1500));
        original.history.push(HistoryEntry::new("console", vec![Value::bytes(b"hi".to_vec())]));
        original.restarts = 3;
        let restored = SessionRecord::from_value(&original.to_value()).unwrap();
        assert_eq!(restored.commands, original.commands);
        assert_eq!(restored.binaries, original.binaries);
        assert_eq!(restored.restarts, 3);
        assert_eq!(restored.timeout, Duration::from_millis(1500));
        assert_eq!(restored.history[0].args, original.history[0].args);
        assert_eq!(
            restored.created.timestamp_millis(),
            original.created.timestamp_millis()
        );
    }
}
