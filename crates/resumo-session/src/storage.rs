//! File-backed session storage.
//!
//! Each session is one append log (`<id>.session`) plus a lock file
//! (`<id>.lock`). Writers hold an exclusive advisory lock on the lock file for
//! as long as their [`StorageHandle`] lives; readers never lock and tolerate a
//! dangling trailing fragment left by a crash mid-append.

use crate::codec;
use crate::config::{StorageConfig, SyncMode};
use chrono::Utc;
use fs2::FileExt;
use resumo_core::{ResumoError, ResumoResult, SessionId, SessionRecord, SessionSummary, Turn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const LOG_EXTENSION: &str = "session";
const LOCK_EXTENSION: &str = "lock";
const TMP_EXTENSION: &str = "tmp";

/// A session found by [`FileStorage::list`].
#[derive(Debug, Clone)]
pub struct StoredSession {
    /// Summary decoded from the log.
    pub summary: SessionSummary,
    /// Path of the log file.
    pub location: PathBuf,
}

/// Exclusive per-session writer lock, released on drop.
#[derive(Debug)]
struct SessionLock {
    file: std::fs::File,
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// An open, exclusively locked session log.
///
/// Mirrors the committed state of the record in memory; only frames that were
/// fully written are reflected in [`StorageHandle::record`].
#[derive(Debug)]
pub struct StorageHandle {
    record: SessionRecord,
    path: PathBuf,
    log: tokio::fs::File,
    committed_len: u64,
    dirty: bool,
    _lock: SessionLock,
    /// Write failures to inject, one per append. Half the frame is written,
    /// then the error is returned.
    #[cfg(test)]
    faults: std::collections::VecDeque<std::io::ErrorKind>,
}

impl StorageHandle {
    /// The session this handle writes to.
    pub fn id(&self) -> &SessionId {
        &self.record.id
    }

    /// The committed record.
    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    /// Path of the log file.
    pub fn location(&self) -> &Path {
        &self.path
    }

    /// Byte length of the committed frames.
    pub fn committed_len(&self) -> u64 {
        self.committed_len
    }

    #[cfg(test)]
    pub(crate) fn inject_fault(&mut self, kind: std::io::ErrorKind) {
        self.faults.push_back(kind);
    }

    #[cfg(test)]
    pub(crate) fn pending_faults(&self) -> usize {
        self.faults.len()
    }
}

/// Session storage rooted at one directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
    sync: SyncMode,
}

impl FileStorage {
    /// Storage under `dir`, created if missing.
    pub async fn new(dir: PathBuf, sync: SyncMode) -> ResumoResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir, sync })
    }

    /// Storage at `config.sessions_dir()`.
    pub async fn from_config(config: &StorageConfig) -> ResumoResult<Self> {
        Self::new(config.sessions_dir(), config.sync).await
    }

    /// The directory holding the session logs.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the log file for `id`.
    pub fn session_path(&self, id: &SessionId) -> PathBuf {
        self.dir.join(format!("{id}.{LOG_EXTENSION}"))
    }

    fn lock_path(&self, id: &SessionId) -> PathBuf {
        self.dir.join(format!("{id}.{LOCK_EXTENSION}"))
    }

    fn tmp_path(&self, id: &SessionId) -> PathBuf {
        self.dir.join(format!("{id}.{LOG_EXTENSION}.{TMP_EXTENSION}"))
    }

    fn acquire_lock(&self, id: &SessionId) -> ResumoResult<SessionLock> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path(id))?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(SessionLock { file }),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(ResumoError::SessionLocked(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a log exists for `id`.
    pub async fn exists(&self, id: &SessionId) -> ResumoResult<bool> {
        Ok(tokio::fs::try_exists(self.session_path(id)).await?)
    }

    /// Creates a new session log and returns it locked for writing.
    ///
    /// The header is written to a temporary file and renamed into place, so a
    /// log file either exists with a complete header or not at all.
    pub async fn create(
        &self,
        id: &SessionId,
        metadata: BTreeMap<String, String>,
    ) -> ResumoResult<StorageHandle> {
        let lock = self.acquire_lock(id)?;
        let path = self.session_path(id);
        if tokio::fs::try_exists(&path).await? {
            return Err(ResumoError::AlreadyExists(id.to_string()));
        }

        let record = SessionRecord::new(id.clone(), metadata);
        let header = codec::encode_header(&record)?;

        let tmp = self.tmp_path(id);
        if let Err(e) = self.write_new_file(&tmp, &header).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        tokio::fs::rename(&tmp, &path).await?;
        self.sync_dir().await?;

        let log = open_append(&path).await?;
        info!(session_id = %id, path = %path.display(), "Session log created");

        Ok(StorageHandle {
            record,
            path,
            log,
            committed_len: header.len() as u64,
            dirty: false,
            _lock: lock,
            #[cfg(test)]
            faults: std::collections::VecDeque::new(),
        })
    }

    /// Opens an existing session log for writing.
    ///
    /// Fails with `NotFound`, `SessionLocked`, `Corrupt` or `Closed`. A dangling
    /// trailing fragment is truncated away before the handle is returned.
    pub async fn open(&self, id: &SessionId) -> ResumoResult<StorageHandle> {
        let path = self.session_path(id);
        if !tokio::fs::try_exists(&path).await? {
            return Err(ResumoError::NotFound(id.to_string()));
        }
        let lock = self.acquire_lock(id)?;

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ResumoError::NotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let decoded = codec::decode_log(&bytes).map_err(|e| corrupt(id, &e))?;
        check_header_id(id, &decoded.record)?;
        if decoded.record.is_closed() {
            return Err(ResumoError::Closed(id.to_string()));
        }

        let log = open_append(&path).await?;
        if decoded.discarded_bytes > 0 {
            warn!(
                session_id = %id,
                discarded_bytes = decoded.discarded_bytes,
                valid_len = decoded.valid_len,
                "Truncating dangling trailing fragment"
            );
            log.set_len(decoded.valid_len).await?;
            if self.sync.is_always() {
                log.sync_data().await?;
            }
        }

        info!(
            session_id = %id,
            turns = decoded.record.turn_count(),
            "Session log opened"
        );

        Ok(StorageHandle {
            record: decoded.record,
            path,
            log,
            committed_len: decoded.valid_len,
            dirty: false,
            _lock: lock,
            #[cfg(test)]
            faults: std::collections::VecDeque::new(),
        })
    }

    /// Durably appends one turn. The turn must carry the record's next sequence number.
    pub async fn append_turn(&self, handle: &mut StorageHandle, turn: &Turn) -> ResumoResult<()> {
        let expected = handle.record.next_sequence();
        if turn.sequence != expected {
            return Err(ResumoError::InvalidState(format!(
                "turn sequence {} does not follow {} in session {}",
                turn.sequence,
                expected,
                handle.id()
            )));
        }

        let frame = codec::encode_turn(turn)?;
        self.append_frame(handle, &frame).await?;
        handle.record.push_turn(turn.clone())?;

        debug!(
            session_id = %handle.id(),
            sequence = turn.sequence,
            role = %turn.role,
            bytes = frame.len(),
            "Turn appended"
        );
        Ok(())
    }

    /// Durably records a metadata update.
    pub async fn append_metadata(
        &self,
        handle: &mut StorageHandle,
        key: &str,
        value: &str,
    ) -> ResumoResult<()> {
        let at = Utc::now();
        let frame = codec::encode_metadata(key, value, at)?;
        self.append_frame(handle, &frame).await?;
        handle.record.metadata.insert(key.to_string(), value.to_string());
        handle.record.touch(at);
        Ok(())
    }

    /// Writes the close marker and releases the handle.
    pub async fn close(&self, mut handle: StorageHandle) -> ResumoResult<SessionRecord> {
        let at = Utc::now();
        let frame = codec::encode_closed(at)?;
        self.append_frame(&mut handle, &frame).await?;
        handle.record.closed_at = Some(at);
        handle.record.touch(at);
        info!(session_id = %handle.id(), "Session closed");
        Ok(handle.record)
    }

    async fn append_frame(&self, handle: &mut StorageHandle, frame: &[u8]) -> ResumoResult<()> {
        if handle.dirty {
            self.rollback(handle).await?;
        }

        handle.dirty = true;
        let sync = self.sync;
        #[cfg(test)]
        let fault = handle.faults.pop_front();
        let log = &mut handle.log;
        let written = async {
            #[cfg(test)]
            if let Some(kind) = fault {
                log.write_all(&frame[..frame.len() / 2]).await?;
                log.flush().await?;
                return Err(std::io::Error::from(kind));
            }
            log.write_all(frame).await?;
            log.flush().await?;
            if sync.is_always() {
                log.sync_data().await?;
            }
            Ok::<(), std::io::Error>(())
        }
        .await;

        match written {
            Ok(()) => {
                handle.committed_len += frame.len() as u64;
                handle.dirty = false;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback(handle).await {
                    warn!(
                        session_id = %handle.id(),
                        error = %rollback_err,
                        "Rollback after failed append failed; \
                         fragment will be discarded on next open"
                    );
                }
                Err(e.into())
            }
        }
    }

    async fn rollback(&self, handle: &mut StorageHandle) -> ResumoResult<()> {
        handle.log.set_len(handle.committed_len).await?;
        handle.dirty = false;
        warn!(
            session_id = %handle.id(),
            committed_len = handle.committed_len,
            "Discarded uncommitted frame"
        );
        Ok(())
    }

    /// Reads a full record without taking the writer lock.
    pub async fn read_all(&self, id: &SessionId) -> ResumoResult<SessionRecord> {
        let path = self.session_path(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ResumoError::NotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let decoded = codec::decode_log(&bytes).map_err(|e| corrupt(id, &e))?;
        check_header_id(id, &decoded.record)?;
        if decoded.discarded_bytes > 0 {
            debug!(
                session_id = %id,
                discarded_bytes = decoded.discarded_bytes,
                "Ignoring trailing fragment"
            );
        }
        Ok(decoded.record)
    }

    /// Lists every readable session. Corrupt records are skipped with a warning.
    pub async fn list(&self) -> ResumoResult<Vec<StoredSession>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut sessions = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let id = match SessionId::parse(stem) {
                Ok(id) => id,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Skipping session file with invalid name"
                    );
                    continue;
                }
            };

            match self.read_all(&id).await {
                Ok(record) => sessions.push(StoredSession {
                    summary: record.summary(),
                    location: path,
                }),
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Skipping unreadable session record");
                }
            }
        }

        sessions.sort_by(|a, b| a.summary.id.cmp(&b.summary.id));
        Ok(sessions)
    }

    /// Deletes a session. Returns `false` if it did not exist.
    ///
    /// Fails with `SessionLocked` while a writer holds the session. The lock file
    /// stays behind: unlinking it would let a process that already opened the old
    /// inode lock it while a new writer locks a fresh one under the same name.
    pub async fn delete(&self, id: &SessionId) -> ResumoResult<bool> {
        let path = self.session_path(id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(false);
        }
        let lock = self.acquire_lock(id)?;

        let existed = match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        drop(lock);

        if existed {
            info!(session_id = %id, "Session deleted");
        }
        Ok(existed)
    }

    async fn write_new_file(&self, path: &Path, bytes: &[u8]) -> ResumoResult<()> {
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        if self.sync.is_always() {
            file.sync_all().await?;
        }
        Ok(())
    }

    async fn sync_dir(&self) -> ResumoResult<()> {
        #[cfg(unix)]
        if self.sync.is_always() {
            tokio::fs::File::open(&self.dir).await?.sync_all().await?;
        }
        Ok(())
    }
}

async fn open_append(path: &Path) -> ResumoResult<tokio::fs::File> {
    Ok(tokio::fs::OpenOptions::new().append(true).open(path).await?)
}

fn corrupt(id: &SessionId, err: &resumo_core::DecodeError) -> ResumoError {
    ResumoError::Corrupt {
        id: id.to_string(),
        reason: err.to_string(),
    }
}

fn check_header_id(id: &SessionId, record: &SessionRecord) -> ResumoResult<()> {
    if record.id != *id {
        return Err(ResumoError::Corrupt {
            id: id.to_string(),
            reason: format!("header names session {}", record.id),
        });
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use resumo_core::Role;
    use tempfile::TempDir;

    async fn temp_storage() -> (FileStorage, TempDir) {
        let tmp = TempDir::new().unwrap();
        let storage = FileStorage::new(tmp.path().join("sessions"), SyncMode::Always)
            .await
            .unwrap();
        (storage, tmp)
    }

    fn id(raw: &str) -> SessionId {
        SessionId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn create_then_read_all() {
        let (storage, _tmp) = temp_storage().await;
        let mut metadata = BTreeMap::new();
        metadata.insert("channel".to_string(), "cli".to_string());

        let handle = storage.create(&id("s1"), metadata).await.unwrap();
        assert_eq!(handle.record().turn_count(), 0);
        drop(handle);

        let record = storage.read_all(&id("s1")).await.unwrap();
        assert_eq!(record.metadata["channel"], "cli");
        assert!(record.turns.is_empty());
    }

    #[tokio::test]
    async fn create_existing_fails() {
        let (storage, _tmp) = temp_storage().await;
        drop(storage.create(&id("dup"), BTreeMap::new()).await.unwrap());

        let err = storage.create(&id("dup"), BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, ResumoError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn open_missing_is_not_found() {
        let (storage, _tmp) = temp_storage().await;
        let err = storage.open(&id("ghost")).await.unwrap_err();
        assert!(matches!(err, ResumoError::NotFound(_)));
        assert!(!storage.lock_path(&id("ghost")).exists());
    }

    #[tokio::test]
    async fn second_writer_is_locked_out_until_release() {
        let (storage, _tmp) = temp_storage().await;
        let first = storage.create(&id("busy"), BTreeMap::new()).await.unwrap();

        let err = storage.open(&id("busy")).await.unwrap_err();
        assert!(matches!(err, ResumoError::SessionLocked(_)));
        let err = storage.delete(&id("busy")).await.unwrap_err();
        assert!(matches!(err, ResumoError::SessionLocked(_)));

        drop(first);
        assert!(storage.open(&id("busy")).await.is_ok());
    }

    #[tokio::test]
    async fn append_requires_next_sequence() {
        let (storage, _tmp) = temp_storage().await;
        let mut handle = storage.create(&id("seq"), BTreeMap::new()).await.unwrap();

        storage
            .append_turn(&mut handle, &Turn::new(0, Role::User, "a"))
            .await
            .unwrap();
        let err = storage
            .append_turn(&mut handle, &Turn::new(0, Role::User, "again"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResumoError::InvalidState(_)));
        assert_eq!(handle.record().next_sequence(), 1);
    }

    #[tokio::test]
    async fn open_truncates_dangling_fragment() {
        let (storage, _tmp) = temp_storage().await;
        let sid = id("torn");
        let mut handle = storage.create(&sid, BTreeMap::new()).await.unwrap();
        storage
            .append_turn(&mut handle, &Turn::new(0, Role::User, "kept"))
            .await
            .unwrap();
        let committed = handle.committed_len();
        drop(handle);

        // Simulate a crash halfway through the next append.
        let frame = codec::encode_turn(&Turn::new(1, Role::Assistant, "lost")).unwrap();
        let mut raw = std::fs::OpenOptions::new()
            .append(true)
            .open(storage.session_path(&sid))
            .unwrap();
        std::io::Write::write_all(&mut raw, &frame[..frame.len() / 2]).unwrap();
        drop(raw);

        let mut handle = storage.open(&sid).await.unwrap();
        assert_eq!(handle.record().turn_count(), 1);
        assert_eq!(handle.committed_len(), committed);
        assert_eq!(
            std::fs::metadata(storage.session_path(&sid)).unwrap().len(),
            committed
        );

        storage
            .append_turn(&mut handle, &Turn::new(1, Role::Assistant, "replayed"))
            .await
            .unwrap();
        drop(handle);

        let record = storage.read_all(&sid).await.unwrap();
        assert_eq!(record.turn_count(), 2);
        assert_eq!(record.turns[1].text(), Some("replayed"));
    }

    #[tokio::test]
    async fn closed_session_cannot_be_opened() {
        let (storage, _tmp) = temp_storage().await;
        let handle = storage.create(&id("done"), BTreeMap::new()).await.unwrap();
        let record = storage.close(handle).await.unwrap();
        assert!(record.is_closed());

        let err = storage.open(&id("done")).await.unwrap_err();
        assert!(matches!(err, ResumoError::Closed(_)));
        assert!(storage.read_all(&id("done")).await.unwrap().is_closed());
    }

    #[tokio::test]
    async fn header_id_must_match_file_name() {
        let (storage, _tmp) = temp_storage().await;
        drop(storage.create(&id("original"), BTreeMap::new()).await.unwrap());
        std::fs::copy(
            storage.session_path(&id("original")),
            storage.session_path(&id("impostor")),
        )
        .unwrap();

        let err = storage.read_all(&id("impostor")).await.unwrap_err();
        assert!(matches!(err, ResumoError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn delete_removes_log_but_keeps_lock_file() {
        let (storage, _tmp) = temp_storage().await;
        drop(storage.create(&id("gone"), BTreeMap::new()).await.unwrap());
        let lock_path = storage.lock_path(&id("gone"));

        assert!(storage.delete(&id("gone")).await.unwrap());
        assert!(!storage.session_path(&id("gone")).exists());
        assert!(lock_path.exists());
        assert!(!storage.delete(&id("gone")).await.unwrap());
    }

    #[tokio::test]
    async fn recreated_session_shares_the_surviving_lock() {
        let (storage, _tmp) = temp_storage().await;
        // An opener of the old lock file, as a second process would hold it.
        let stale = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(storage.lock_path(&id("again")))
            .unwrap();
        drop(storage.create(&id("again"), BTreeMap::new()).await.unwrap());
        assert!(storage.delete(&id("again")).await.unwrap());

        let writer = storage.create(&id("again"), BTreeMap::new()).await.unwrap();
        assert!(FileExt::try_lock_exclusive(&stale).is_err());
        drop(writer);
        assert!(FileExt::try_lock_exclusive(&stale).is_ok());
        FileExt::unlock(&stale).unwrap();
    }

    #[tokio::test]
    async fn failed_append_rolls_back_partial_frame() {
        let (storage, _tmp) = temp_storage().await;
        let sid = id("flaky");
        let mut handle = storage.create(&sid, BTreeMap::new()).await.unwrap();
        storage
            .append_turn(&mut handle, &Turn::new(0, Role::User, "first"))
            .await
            .unwrap();
        let committed = handle.committed_len();

        handle.inject_fault(std::io::ErrorKind::Interrupted);
        let err = storage
            .append_turn(&mut handle, &Turn::new(1, Role::Assistant, "torn"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(!handle.dirty);
        assert_eq!(handle.committed_len(), committed);
        assert_eq!(handle.record().next_sequence(), 1);
        assert_eq!(std::fs::metadata(storage.session_path(&sid)).unwrap().len(), committed);

        storage
            .append_turn(&mut handle, &Turn::new(1, Role::Assistant, "whole"))
            .await
            .unwrap();
        drop(handle);

        let bytes = std::fs::read(storage.session_path(&sid)).unwrap();
        let record = codec::decode(&bytes).unwrap();
        let sequences: Vec<u64> = record.turns.iter().map(|t| t.sequence).collect();
        assert_eq!(sequences, vec![0, 1]);
        assert_eq!(record.turns[1].text(), Some("whole"));
    }

    #[tokio::test]
    async fn dirty_handle_is_truncated_before_next_append() {
        let (storage, _tmp) = temp_storage().await;
        let sid = id("dirty");
        let mut handle = storage.create(&sid, BTreeMap::new()).await.unwrap();
        storage
            .append_turn(&mut handle, &Turn::new(0, Role::User, "first"))
            .await
            .unwrap();
        let committed = handle.committed_len();

        // A write that was cancelled after part of the frame hit the file.
        let frame = codec::encode_turn(&Turn::new(1, Role::Assistant, "cancelled")).unwrap();
        handle.log.write_all(&frame[..frame.len() / 3]).await.unwrap();
        handle.log.flush().await.unwrap();
        handle.dirty = true;
        assert!(std::fs::metadata(storage.session_path(&sid)).unwrap().len() > committed);

        storage
            .append_turn(&mut handle, &Turn::new(1, Role::Assistant, "next"))
            .await
            .unwrap();
        assert!(!handle.dirty);
        let expected_len = handle.committed_len();
        drop(handle);

        let bytes = std::fs::read(storage.session_path(&sid)).unwrap();
        assert_eq!(bytes.len() as u64, expected_len);
        let decoded = codec::decode_log(&bytes).unwrap();
        assert_eq!(decoded.discarded_bytes, 0);
        let sequences: Vec<u64> = decoded.record.turns.iter().map(|t| t.sequence).collect();
        assert_eq!(sequences, vec![0, 1]);
        assert_eq!(decoded.record.turns[1].text(), Some("next"));
    }
}
