use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use titan_comm::{CodecError, decode, encode};
use tracing::warn;

use super::SessionRecord;

/// Prefix of every stored record, followed by the encoded record value.
pub const RECORD_MAGIC: &[u8; 4] = b"pkg1";
const EXTENSION: &str = "session";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session store i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("session record could not be decoded: {0}")]
    Codec(#[from] CodecError),
    #[error("corrupt session record: {0}")]
    Corrupt(String),
}

pub fn encode_record(record: &SessionRecord) -> Vec<u8> {
    let mut out = RECORD_MAGIC.to_vec();
    out.extend(encode(&record.to_value()));
    out
}

pub fn decode_record(bytes: &[u8]) -> Result<SessionRecord, StoreError> {
    let body = bytes
        .strip_prefix(RECORD_MAGIC.as_slice())
        .ok_or_else(|| StoreError::Corrupt("missing record header".to_string()))?;
    SessionRecord::from_value(&decode(body)?)
}

#[async_trait]
pub trait SessionStore: Send + Sync + Debug {
    async fn save(&self, record: &SessionRecord) -> Result<(), StoreError>;
    async fn load(&self, id: &str) -> Result<Option<SessionRecord>, StoreError>;
    async fn remove(&self, id: &str) -> Result<(), StoreError>;
    async fn list(&self) -> Result<Vec<SessionRecord>, StoreError>;

    async fn contains(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.load(id).await?.is_some())
    }
}

/// Keeps encoded records in memory.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    records: DashMap<String, Vec<u8>>,
}

impl InMemorySessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.records.insert(record.id.clone(), encode_record(record));
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        match self.records.get(id) {
            Some(bytes) => decode_record(bytes.value()).map(Some),
            None => Ok(None),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.records.remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.records
            .iter()
            .map(|entry| decode_record(entry.value()))
            .collect()
    }
}

/// One `<id>.session` file per record under a state directory.
///
/// Writes go to a temporary file that is renamed over the old record, so a
/// crash leaves either the previous or the new version on disk.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Arc<Self>, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Arc::new(Self { dir }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: &str) -> Result<PathBuf, StoreError> {
        let valid = !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::Corrupt(format!("invalid session id {id:?}")));
        }
        Ok(self.dir.join(format!("{id}.{EXTENSION}")))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let path = self.path(&record.id)?;
        let partial = path.with_extension(format!("{EXTENSION}.tmp"));
        tokio::fs::write(&partial, encode_record(record)).await?;
        tokio::fs::rename(&partial, &path).await?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        match tokio::fs::read(self.path(id)?).await {
            Ok(bytes) => decode_record(&bytes).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path(id)?).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    /// Unreadable records are skipped with a warning.
    async fn list(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let loaded = match tokio::fs::read(&path).await {
                Ok(bytes) => decode_record(&bytes),
                Err(err) => Err(err.into()),
            };
            match loaded {
                Ok(record) => records.push(record),
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable session record"),
            }
        }
        records.sort_by_key(|record| record.created);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Binaries, SessionRecord, SessionStatus};
    use std::time::Duration;
    use tempfile::TempDir;

    fn record(id: &str) -> SessionRecord {
        let mut binaries = Binaries::new();
        binaries.insert("top.bit".to_string(), vec![0xde, 0xad]);
        SessionRecord::new(
            id.to_string(),
            "bob".to_string(),
            binaries,
            vec![vec!["load-bitstream".to_string(), "top.bit".to_string()]],
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_file_store_save_load_remove() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::open(dir.path()).await.unwrap();

        let mut saved = record("abc-1");
        store.save(&saved).await.unwrap();
        saved.status = SessionStatus::Done;
        store.save(&saved).await.unwrap();

        let loaded = store.load("abc-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Done);
        assert_eq!(loaded.binaries, saved.binaries);
        assert!(store.contains("abc-1").await.unwrap());

        store.remove("abc-1").await.unwrap();
        store.remove("abc-1").await.unwrap();
        assert!(store.load("abc-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_lists_and_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::open(dir.path()).await.unwrap();
        store.save(&record("one")).await.unwrap();
        store.save(&record("two")).await.unwrap();
        std::fs::write(dir.path().join("broken.session"), b"nope").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let mut ids: Vec<_> = store.list().await.unwrap().into_iter().map(|r| r.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_like_ids() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::open(dir.path()).await.unwrap();
        assert!(matches!(
            store.load("../escape").await,
            Err(StoreError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_in_memory_store_keeps_independent_copies() {
        let store = InMemorySessionStore::new();
        let mut saved = record("mem");
        store.save(&saved).await.unwrap();
        saved.restarts = 4;
        assert_eq!(store.load("mem").await.unwrap().unwrap().restarts, 0);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[test]
    fn test_decode_requires_header() {
        let bytes = encode_record(&record("x"));
        assert!(decode_record(&bytes).is_ok());
        assert!(matches!(decode_record(&bytes[4..]), Err(StoreError::Corrupt(_))));
    }
}
