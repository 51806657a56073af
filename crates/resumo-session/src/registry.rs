use crate::storage::{FileStorage, StorageHandle, StoredSession};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use resumo_core::{ResumoResult, SessionId, SessionRecord};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;

/// In-memory summary of one stored session.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    /// Session identifier.
    pub id: SessionId,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Last append, metadata change or touch.
    pub last_active_at: DateTime<Utc>,
    /// Committed turns.
    pub turn_count: u64,
    /// Whether the session was closed.
    pub closed: bool,
    /// Path of the session log.
    pub location: PathBuf,
}

impl RegistryEntry {
    /// Summarizes a loaded record stored at `location`.
    pub fn from_record(record: &SessionRecord, location: PathBuf) -> Self {
        Self {
            id: record.id.clone(),
            created_at: record.created_at,
            last_active_at: record.last_active_at,
            turn_count: record.turn_count(),
            closed: record.is_closed(),
            location,
        }
    }

    /// Summarizes the record behind an open handle.
    pub fn from_handle(handle: &StorageHandle) -> Self {
        Self::from_record(handle.record(), handle.location().to_path_buf())
    }
}

impl From<StoredSession> for RegistryEntry {
    fn from(stored: StoredSession) -> Self {
        Self {
            id: stored.summary.id,
            created_at: stored.summary.created_at,
            last_active_at: stored.summary.last_active_at,
            turn_count: stored.summary.turn_count,
            closed: stored.summary.closed,
            location: stored.location,
        }
    }
}

/// Read-mostly cache of known sessions, rebuilt from storage on demand.
///
/// Storage stays the source of truth: the registry may be discarded and
/// rebuilt at any time.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: RwLock<HashMap<SessionId, RegistryEntry>>,
}

impl SessionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry by scanning storage.
    pub async fn build(storage: &FileStorage) -> ResumoResult<Self> {
        let registry = Self::new();
        registry.rebuild(storage).await?;
        Ok(registry)
    }

    /// Replaces the contents with a fresh scan. Returns the number of sessions found.
    pub async fn rebuild(&self, storage: &FileStorage) -> ResumoResult<usize> {
        let scanned: HashMap<SessionId, RegistryEntry> = storage
            .list()
            .await?
            .into_iter()
            .map(|stored| (stored.summary.id.clone(), RegistryEntry::from(stored)))
            .collect();
        let count = scanned.len();
        *self.entries.write() = scanned;
        info!(sessions = count, dir = %storage.dir().display(), "Session registry rebuilt");
        Ok(count)
    }

    /// The entry for `id`, if known.
    pub fn lookup(&self, id: &SessionId) -> Option<RegistryEntry> {
        self.entries.read().get(id).cloned()
    }

    /// Inserts or replaces the entry for `entry.id`.
    pub fn upsert(&self, entry: RegistryEntry) {
        self.entries.write().insert(entry.id.clone(), entry);
    }

    /// Forgets `id`, returning its entry.
    pub fn remove(&self, id: &SessionId) -> Option<RegistryEntry> {
        self.entries.write().remove(id)
    }

    /// All entries, most recently active first.
    pub fn all(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<RegistryEntry> = self.entries.read().values().cloned().collect();
        entries.sort_by(|a, b| {
            b.last_active_at
                .cmp(&a.last_active_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        entries
    }

    /// Number of known sessions.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no session is known.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
