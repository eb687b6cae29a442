use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use titan_comm::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerInfo {
    pub id: Uuid,
    pub name: String,
    pub connected: DateTime<Utc>,
    /// Session the worker is running right now.
    pub session: Option<String>,
}

impl WorkerInfo {
    pub fn to_value(&self) -> Value {
        Value::record([
            ("id", Value::from(self.id.to_string())),
            ("name", Value::from(self.name.as_str())),
            ("connected", Value::from(self.connected.to_rfc3339())),
            ("session", self.session.as_deref().map_or(Value::Null, Value::from)),
        ])
    }
}

/// Connected workers and what each one is doing.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    workers: Arc<DashMap<Uuid, WorkerInfo>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.workers.insert(
            id,
            WorkerInfo {
                id,
                name: name.to_string(),
                connected: Utc::now(),
                session: None,
            },
        );
        id
    }

    pub fn set_session(&self, id: Uuid, session: Option<&str>) {
        if let Some(mut worker) = self.workers.get_mut(&id) {
            worker.session = session.map(str::to_owned);
        }
    }

    pub fn unregister(&self, id: Uuid) {
        self.workers.remove(&id);
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Snapshot ordered by connect time.
    pub fn list(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<_> = self.workers.iter().map(|entry| entry.value().clone()).collect();
        workers.sort_by_key(|worker| worker.connected);
        workers
    }
}
