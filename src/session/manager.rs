use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::future::Cache;
use thiserror::Error;
use titan_comm::Value;
use tracing::{debug, info};
use uuid::Uuid;

use super::store::{SessionStore, StoreError};
use super::{Binaries, Command, DEFAULT_TIMEOUT, Healthcheck, Session, SessionRecord, SessionStatus};
use crate::logger::SESSION_TARGET;
use crate::queue::{Position, QueueError, WorkQueue};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("session {0} is running and cannot be removed")]
    Running(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub default_timeout: Duration,
    /// How long an untouched finished session stays in memory.
    pub finished_ttl: Duration,
    pub healthcheck: Healthcheck,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            finished_ttl: Duration::from_secs(3600),
            healthcheck: Healthcheck::default(),
        }
    }
}

/// What a client is told about one of its sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub id: String,
    pub status: SessionStatus,
    pub restarts: u32,
    pub created: DateTime<Utc>,
    pub position: Option<Position>,
    pub workers: usize,
}

impl SessionSummary {
    pub fn to_value(&self) -> Value {
        let position = match self.position {
            Some(Position::Waiting(index)) => Value::from(index as f64),
            Some(Position::Running) => Value::from(0),
            None => Value::Null,
        };
        Value::record([
            ("id", Value::from(self.id.as_str())),
            ("status", Value::from(self.status.as_str())),
            ("restarts", Value::from(self.restarts as f64)),
            ("created", Value::from(self.created.to_rfc3339())),
            ("position", position),
            ("workers", Value::from(self.workers as f64)),
        ])
    }
}

/// Owns every live session, the shared work queue and the finished-session cache.
pub struct SessionManager {
    queue: WorkQueue<Session>,
    live: DashMap<String, Arc<Session>>,
    finished: Cache<String, Arc<Session>>,
    store: Arc<dyn SessionStore>,
    options: ManagerOptions,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, options: ManagerOptions) -> Arc<Self> {
        let finished = Cache::builder()
            .time_to_idle(options.finished_ttl)
            .eviction_listener(|id: Arc<String>, _session: Arc<Session>, cause| {
                debug!(session = %id, ?cause, "finished session left the cache");
            })
            .build();
        let manager = Arc::new(Self {
            queue: WorkQueue::new(),
            live: DashMap::new(),
            finished,
            store,
            options,
        });
        Self::spawn_position_pump(&manager);
        manager
    }

    pub fn queue(&self) -> &WorkQueue<Session> {
        &self.queue
    }

    pub fn healthcheck(&self) -> &Healthcheck {
        &self.options.healthcheck
    }

    /// Tells every waiting session its place whenever the queue changes.
    fn spawn_position_pump(manager: &Arc<Self>) {
        let weak = Arc::downgrade(manager);
        let mut status = manager.queue.watch();
        tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let workers = status.borrow_and_update().workers;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                for entry in manager.live.iter() {
                    if let Some(Position::Waiting(position)) = manager.queue.position(entry.value()) {
                        entry.value().notify_queued(position, workers);
                    }
                }
            }
        });
    }

    /// Re-queues sessions left pending or running by a previous process.
    pub async fn restore(&self) -> Result<usize, ManagerError> {
        let mut restored = 0;
        for mut record in self.store.list().await? {
            match record.status {
                SessionStatus::Done => {}
                SessionStatus::Deleted => self.store.remove(&record.id).await?,
                SessionStatus::Pending | SessionStatus::Running => {
                    record.status = SessionStatus::Pending;
                    let session = Session::new(record, Arc::clone(&self.store));
                    session.persist().await;
                    self.live.insert(session.id().to_string(), Arc::clone(&session));
                    self.queue.push(session)?;
                    restored += 1;
                }
            }
        }
        if restored > 0 {
            info!(restored, "restored unfinished sessions");
        }
        Ok(restored)
    }

    async fn fresh_id(&self) -> Result<String, ManagerError> {
        loop {
            let id = Uuid::new_v4().to_string();
            if self.live.contains_key(&id) || self.finished.contains_key(&id) {
                continue;
            }
            if !self.store.contains(&id).await? {
                return Ok(id);
            }
        }
    }

    /// Creates, persists and queues a session. Empty binaries or commands fall
    /// back to the health check job.
    pub async fn submit(
        &self,
        owner: &str,
        binaries: Binaries,
        commands: Vec<Command>,
        timeout: Option<Duration>,
    ) -> Result<Arc<Session>, ManagerError> {
        let binaries = if binaries.is_empty() {
            self.options.healthcheck.binaries().clone()
        } else {
            binaries
        };
        let commands = if commands.is_empty() {
            self.options.healthcheck.commands()
        } else {
            commands
        };
        let id = self.fresh_id().await?;
        let record = SessionRecord::new(
            id.clone(),
            owner.to_string(),
            binaries,
            commands,
            timeout.unwrap_or(self.options.default_timeout),
        );
        let session = Session::new(record, Arc::clone(&self.store));
        session.persist().await;
        self.live.insert(id.clone(), Arc::clone(&session));
        if let Err(err) = self.queue.push(Arc::clone(&session)) {
            self.live.remove(&id);
            self.store.remove(&id).await?;
            return Err(err.into());
        }
        info!(target: SESSION_TARGET, session = %id, owner, "session submitted");
        Ok(session)
    }

    /// Looks a session up for its owner, loading finished ones from the store.
    pub async fn get(&self, owner: &str, id: &str) -> Result<Option<Arc<Session>>, ManagerError> {
        let session = match self.lookup(id).await? {
            Some(session) => session,
            None => return Ok(None),
        };
        Ok((session.owner() == owner).then_some(session))
    }

    async fn lookup(&self, id: &str) -> Result<Option<Arc<Session>>, ManagerError> {
        if let Some(session) = self.live.get(id) {
            return Ok(Some(Arc::clone(session.value())));
        }
        if let Some(session) = self.finished.get(id).await {
            return Ok(Some(session));
        }
        let Some(record) = self.store.load(id).await? else {
            return Ok(None);
        };
        let session = Session::new(record, Arc::clone(&self.store));
        self.finished.insert(id.to_string(), Arc::clone(&session)).await;
        Ok(Some(session))
    }

    pub fn summary(&self, session: &Arc<Session>) -> SessionSummary {
        let record = session.record();
        SessionSummary {
            id: record.id,
            status: record.status,
            restarts: record.restarts,
            created: record.created,
            position: self.queue.position(session),
            workers: self.queue.snapshot().workers,
        }
    }

    /// Every stored session of `owner`, oldest first.
    pub async fn list(&self, owner: &str) -> Result<Vec<SessionSummary>, ManagerError> {
        let workers = self.queue.snapshot().workers;
        let mut summaries = Vec::new();
        for record in self.store.list().await? {
            if record.owner != owner {
                continue;
            }
            let summary = match self.live.get(&record.id) {
                Some(live) => self.summary(live.value()),
                None => SessionSummary {
                    id: record.id,
                    status: record.status,
                    restarts: record.restarts,
                    created: record.created,
                    position: None,
                    workers,
                },
            };
            summaries.push(summary);
        }
        summaries.sort_by_key(|summary| summary.created);
        Ok(summaries)
    }

    /// Deletes a pending or finished session. Unknown ids are not an error.
    /// A session a worker has already pulled counts as running.
    pub async fn remove(&self, owner: &str, id: &str) -> Result<bool, ManagerError> {
        let Some(session) = self.get(owner, id).await? else {
            return Ok(false);
        };
        if self.queue.position(&session) == Some(Position::Running) {
            return Err(ManagerError::Running(id.to_string()));
        }
        match session.status() {
            SessionStatus::Running => return Err(ManagerError::Running(id.to_string())),
            SessionStatus::Deleted => return Ok(false),
            SessionStatus::Pending | SessionStatus::Done => {}
        }
        self.queue.remove(&session);
        self.live.remove(id);
        self.finished.invalidate(id).await;
        session.delete().await;
        Ok(true)
    }

    /// Moves a session that will not run again out of the live set.
    pub async fn finish(&self, session: &Arc<Session>) {
        let id = session.id().to_string();
        if self.live.remove(&id).is_some() {
            self.finished.insert(id, Arc::clone(session)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::InMemorySessionStore;
    use crate::session::{SessionEvent, SessionRecord};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn binaries() -> Binaries {
        let mut binaries = Binaries::new();
        binaries.insert("fw.bin".to_string(), vec![9]);
        binaries
    }

    fn commands() -> Vec<Command> {
        vec![vec!["bootstrap".to_string(), "fw.bin".to_string()]]
    }

    #[tokio::test]
    async fn test_submit_persists_and_queues() {
        let store = InMemorySessionStore::new();
        let manager = SessionManager::new(store.clone(), ManagerOptions::default());
        let session = manager.submit("alice", binaries(), commands(), None).await.unwrap();

        assert!(Uuid::parse_str(session.id()).is_ok());
        assert_eq!(manager.queue().position(&session), Some(Position::Waiting(1)));
        let stored = store.load(session.id()).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Pending);
        assert_eq!(stored.timeout, DEFAULT_TIMEOUT);
    }

    #[tokio::test]
    async fn test_empty_submission_runs_the_health_check_job() {
        let mut check = Binaries::new();
        check.insert("top.bit".to_string(), vec![1]);
        let options = ManagerOptions {
            healthcheck: Healthcheck::new(check.clone()),
            ..ManagerOptions::default()
        };
        let manager = SessionManager::new(InMemorySessionStore::new(), options);
        let session = manager.submit("alice", Binaries::new(), Vec::new(), None).await.unwrap();
        let record = session.record();
        assert_eq!(record.binaries, check);
        assert_eq!(record.commands, manager.healthcheck().commands());
    }

    #[tokio::test]
    async fn test_sessions_are_scoped_to_their_owner() {
        let manager = SessionManager::new(InMemorySessionStore::new(), ManagerOptions::default());
        let session = manager.submit("alice", binaries(), commands(), None).await.unwrap();

        assert!(manager.get("alice", session.id()).await.unwrap().is_some());
        assert!(manager.get("mallory", session.id()).await.unwrap().is_none());
        assert!(!manager.remove("mallory", session.id()).await.unwrap());
        assert_eq!(manager.list("alice").await.unwrap().len(), 1);
        assert!(manager.list("mallory").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_leaves_the_queue() {
        let store = InMemorySessionStore::new();
        let manager = SessionManager::new(store.clone(), ManagerOptions::default());
        let session = manager.submit("alice", binaries(), commands(), None).await.unwrap();
        let mut events = session.subscribe();

        assert!(manager.remove("alice", session.id()).await.unwrap());
        assert!(!manager.remove("alice", session.id()).await.unwrap());
        assert_eq!(manager.queue().position(&session), None);
        assert!(store.load(session.id()).await.unwrap().is_none());
        assert_eq!(session.status(), SessionStatus::Deleted);

        let mut last = None;
        while let Ok(Some(event)) = timeout(WAIT, events.recv()).await {
            last = Some(event);
        }
        assert_eq!(last, Some(SessionEvent::Deleted));
    }

    #[tokio::test]
    async fn test_running_sessions_cannot_be_removed() {
        let manager = SessionManager::new(InMemorySessionStore::new(), ManagerOptions::default());
        let session = manager.submit("alice", binaries(), commands(), None).await.unwrap();
        session.set_status(SessionStatus::Running).await;
        assert!(matches!(
            manager.remove("alice", session.id()).await,
            Err(ManagerError::Running(_))
        ));
    }

    #[tokio::test]
    async fn test_leased_sessions_cannot_be_removed_before_they_start() {
        let store = InMemorySessionStore::new();
        let manager = SessionManager::new(store.clone(), ManagerOptions::default());
        let session = manager.submit("alice", binaries(), commands(), None).await.unwrap();

        let mut tasks = manager.queue().tasks();
        let lease = timeout(WAIT, tasks.next()).await.unwrap().unwrap();
        assert_eq!(lease.task().status(), SessionStatus::Pending);
        assert!(matches!(
            manager.remove("alice", session.id()).await,
            Err(ManagerError::Running(_))
        ));

        lease.task().set_status(SessionStatus::Running).await;
        assert_eq!(session.status(), SessionStatus::Running);
        assert!(store.load(session.id()).await.unwrap().is_some());

        drop(lease);
        session.set_status(SessionStatus::Done).await;
        assert!(manager.remove("alice", session.id()).await.unwrap());
        session.set_status(SessionStatus::Running).await;
        assert_eq!(session.status(), SessionStatus::Deleted);
        assert!(store.load(session.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_waiting_sessions_hear_their_position() {
        let manager = SessionManager::new(InMemorySessionStore::new(), ManagerOptions::default());
        let first = manager.submit("alice", binaries(), commands(), None).await.unwrap();
        let second = manager.submit("alice", binaries(), commands(), None).await.unwrap();
        let mut events = second.subscribe();

        let mut tasks = manager.queue().tasks();
        let lease = timeout(WAIT, tasks.next()).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(lease.task(), &first));

        let queued = timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Some(SessionEvent::Queued { position: 1, workers: 1 }) => break true,
                    Some(_) => continue,
                    None => break false,
                }
            }
        })
        .await
        .unwrap();
        assert!(queued);
    }

    #[tokio::test]
    async fn test_restore_requeues_unfinished_sessions() {
        let store = InMemorySessionStore::new();
        for (id, status) in [
            ("a", SessionStatus::Running),
            ("b", SessionStatus::Done),
            ("c", SessionStatus::Pending),
        ] {
            let mut record = SessionRecord::new(
                id.to_string(),
                "alice".to_string(),
                binaries(),
                commands(),
                DEFAULT_TIMEOUT,
            );
            record.status = status;
            store.save(&record).await.unwrap();
        }

        let manager = SessionManager::new(store.clone(), ManagerOptions::default());
        assert_eq!(manager.restore().await.unwrap(), 2);
        assert_eq!(manager.queue().snapshot().pending, 2);
        assert_eq!(store.load("a").await.unwrap().unwrap().status, SessionStatus::Pending);

        let done = manager.get("alice", "b").await.unwrap().unwrap();
        assert_eq!(done.status(), SessionStatus::Done);
        assert_eq!(manager.queue().position(&done), None);
    }

    #[tokio::test]
    async fn test_finish_moves_sessions_to_the_cache() {
        let manager = SessionManager::new(InMemorySessionStore::new(), ManagerOptions::default());
        let session = manager.submit("alice", binaries(), commands(), None).await.unwrap();
        manager.finish(&session).await;
        let found = manager.get("alice", session.id()).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &session));
    }
}
