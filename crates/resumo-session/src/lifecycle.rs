//! The per-session state machine.
//!
//! ```text
//! Idle ─resolve─▶ Resolving ─ok─▶ Active ─suspend─▶ Suspended ─resolve─▶ Resolving
//!                     │              └─close─▶ Closed
//!                     └─error─▶ Idle
//! ```
//!
//! While `Active` the controller owns a [`StorageHandle`], and with it the
//! exclusive lock on the session. Leaving `Active` drops the handle.

use crate::registry::{RegistryEntry, SessionRegistry};
use crate::retry::RetryPolicy;
use crate::storage::{FileStorage, StorageHandle};
use resumo_core::{ResumoError, ResumoResult, Role, SessionId, SessionRecord, Turn};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Lifecycle states of a [`SessionController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session bound yet.
    Idle,
    /// Looking up or creating a session.
    Resolving,
    /// Bound to a session and accepting turns.
    Active,
    /// Released cleanly; the session can be resumed later.
    Suspended,
    /// Administratively terminated.
    Closed,
}

/// Binds one caller to one session at a time and persists its turns.
pub struct SessionController {
    storage: Arc<FileStorage>,
    registry: Arc<SessionRegistry>,
    retry: RetryPolicy,
    state: SessionState,
    handle: Option<StorageHandle>,
    resumed: bool,
}

impl SessionController {
    /// Creates an idle controller.
    pub fn new(
        storage: Arc<FileStorage>,
        registry: Arc<SessionRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            storage,
            registry,
            retry,
            state: SessionState::Idle,
            handle: None,
            resumed: false,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The bound session, while `Active`.
    pub fn session_id(&self) -> Option<&SessionId> {
        self.handle.as_ref().map(StorageHandle::id)
    }

    /// The committed record, while `Active`.
    pub fn record(&self) -> Option<&SessionRecord> {
        self.handle.as_ref().map(StorageHandle::record)
    }

    /// Whether the bound session existed before it was resolved.
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// Resumes `id`, or creates a fresh session when `id` is `None`.
    ///
    /// `metadata` is only recorded for new sessions. Resuming an identifier that
    /// does not exist fails with `NotFound`; the caller decides whether to create.
    pub async fn resolve(
        &mut self,
        id: Option<SessionId>,
        metadata: BTreeMap<String, String>,
    ) -> ResumoResult<SessionId> {
        if self.state == SessionState::Active {
            return Err(ResumoError::InvalidState(format!(
                "controller already bound to session {}",
                self.session_id().map(ToString::to_string).unwrap_or_default()
            )));
        }

        self.state = SessionState::Resolving;
        let resumed = id.is_some();
        let resolved = match id {
            Some(id) => self.resume(&id).await,
            None => self.create(metadata).await,
        };

        match resolved {
            Ok(handle) => {
                let id = handle.id().clone();
                self.registry.upsert(RegistryEntry::from_handle(&handle));
                info!(
                    session_id = %id,
                    resumed,
                    next_sequence = handle.record().next_sequence(),
                    "Session active"
                );
                self.handle = Some(handle);
                self.resumed = resumed;
                self.state = SessionState::Active;
                Ok(id)
            }
            Err(e) => {
                self.state = SessionState::Idle;
                Err(e)
            }
        }
    }

    async fn resume(&self, id: &SessionId) -> ResumoResult<StorageHandle> {
        match self.registry.lookup(id) {
            Some(entry) if entry.closed => return Err(ResumoError::Closed(id.to_string())),
            Some(_) => {}
            // The registry can lag behind sessions created by other processes.
            None => {
                if !self.storage.exists(id).await? {
                    return Err(ResumoError::NotFound(id.to_string()));
                }
            }
        }

        match self.storage.open(id).await {
            Err(ResumoError::NotFound(missing)) => {
                self.registry.remove(id);
                Err(ResumoError::NotFound(missing))
            }
            Err(ResumoError::Closed(closed)) => {
                if let Ok(record) = self.storage.read_all(id).await {
                    self.registry.upsert(RegistryEntry::from_record(
                        &record,
                        self.storage.session_path(id),
                    ));
                }
                Err(ResumoError::Closed(closed))
            }
            other => other,
        }
    }

    async fn create(&self, metadata: BTreeMap<String, String>) -> ResumoResult<StorageHandle> {
        let id = SessionId::generate();
        self.storage.create(&id, metadata).await
    }

    /// Persists one turn with the next sequence number and returns it.
    ///
    /// Transient I/O failures are retried per the retry policy; any partial
    /// write is rolled back before the next attempt.
    pub async fn append(&mut self, role: Role, content: serde_json::Value) -> ResumoResult<Turn> {
        let handle = active(&mut self.handle, self.state)?;
        let turn = Turn::new(handle.record().next_sequence(), role, content);

        let mut attempt = 0;
        loop {
            match self.storage.append_turn(handle, &turn).await {
                Ok(()) => break,
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        session_id = %handle.id(),
                        sequence = turn.sequence,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Append failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }

        self.registry.upsert(RegistryEntry::from_handle(handle));
        Ok(turn)
    }

    /// Records a metadata key on the bound session.
    pub async fn set_metadata(&mut self, key: &str, value: &str) -> ResumoResult<()> {
        let handle = active(&mut self.handle, self.state)?;
        self.storage.append_metadata(handle, key, value).await?;
        self.registry.upsert(RegistryEntry::from_handle(handle));
        Ok(())
    }

    /// Releases the session so it can be resumed later. No-op unless `Active`.
    pub fn suspend(&mut self) {
        if let Some(handle) = self.handle.take() {
            info!(
                session_id = %handle.id(),
                turns = handle.record().turn_count(),
                "Session suspended"
            );
            self.state = SessionState::Suspended;
        }
    }

    /// Closes the bound session for good.
    pub async fn close(&mut self) -> ResumoResult<()> {
        active(&mut self.handle, self.state)?;
        let Some(handle) = self.handle.take() else {
            return Err(ResumoError::InvalidState("no session bound".into()));
        };
        let location = handle.location().to_path_buf();
        let result = self.storage.close(handle).await;
        match result {
            Ok(record) => {
                self.registry
                    .upsert(RegistryEntry::from_record(&record, location));
                self.state = SessionState::Closed;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Suspended;
                Err(e)
            }
        }
    }
}

fn active(
    handle: &mut Option<StorageHandle>,
    state: SessionState,
) -> ResumoResult<&mut StorageHandle> {
    handle
        .as_mut()
        .ok_or_else(|| ResumoError::InvalidState(format!("no active session (state {state:?})")))
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.suspend();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::SyncMode;
    use tempfile::TempDir;

    async fn setup() -> (Arc<FileStorage>, Arc<SessionRegistry>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let storage = Arc::new(
            FileStorage::new(tmp.path().join("sessions"), SyncMode::Always)
                .await
                .unwrap(),
        );
        let registry = Arc::new(SessionRegistry::build(&storage).await.unwrap());
        (storage, registry, tmp)
    }

    fn controller(
        storage: &Arc<FileStorage>,
        registry: &Arc<SessionRegistry>,
    ) -> SessionController {
        SessionController::new(storage.clone(), registry.clone(), RetryPolicy::none())
    }

    #[tokio::test]
    async fn create_append_suspend_resume() {
        let (storage, registry, _tmp) = setup().await;
        let mut ctl = controller(&storage, &registry);
        assert_eq!(ctl.state(), SessionState::Idle);

        let id = ctl.resolve(None, BTreeMap::new()).await.unwrap();
        assert_eq!(ctl.state(), SessionState::Active);
        assert!(!ctl.is_resumed());

        let t0 = ctl.append(Role::User, "hello".into()).await.unwrap();
        let t1 = ctl.append(Role::Assistant, "hi".into()).await.unwrap();
        assert_eq!((t0.sequence, t1.sequence), (0, 1));
        assert_eq!(registry.lookup(&id).unwrap().turn_count, 2);

        ctl.suspend();
        assert_eq!(ctl.state(), SessionState::Suspended);
        assert!(ctl.append(Role::User, "rejected".into()).await.is_err());

        let again = ctl.resolve(Some(id.clone()), BTreeMap::new()).await.unwrap();
        assert_eq!(again, id);
        assert!(ctl.is_resumed());
        let t2 = ctl.append(Role::User, "more".into()).await.unwrap();
        assert_eq!(t2.sequence, 2);
    }

    #[tokio::test]
    async fn resolve_unknown_id_is_not_found_and_returns_to_idle() {
        let (storage, registry, _tmp) = setup().await;
        let mut ctl = controller(&storage, &registry);

        let err = ctl
            .resolve(Some(SessionId::parse("S2").unwrap()), BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ResumoError::NotFound(_)));
        assert_eq!(ctl.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn second_controller_is_locked_out() {
        let (storage, registry, _tmp) = setup().await;
        let mut first = controller(&storage, &registry);
        let id = first.resolve(None, BTreeMap::new()).await.unwrap();

        let mut second = controller(&storage, &registry);
        let err = second.resolve(Some(id.clone()), BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, ResumoError::SessionLocked(_)));

        drop(first);
        second.resolve(Some(id), BTreeMap::new()).await.unwrap();
    }

    #[tokio::test]
    async fn resolve_while_active_is_rejected() {
        let (storage, registry, _tmp) = setup().await;
        let mut ctl = controller(&storage, &registry);
        ctl.resolve(None, BTreeMap::new()).await.unwrap();

        let err = ctl.resolve(None, BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, ResumoError::InvalidState(_)));
        assert_eq!(ctl.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn closed_session_is_not_resumable() {
        let (storage, registry, _tmp) = setup().await;
        let mut ctl = controller(&storage, &registry);
        let id = ctl.resolve(None, BTreeMap::new()).await.unwrap();
        ctl.close().await.unwrap();
        assert_eq!(ctl.state(), SessionState::Closed);
        assert!(registry.lookup(&id).unwrap().closed);

        let mut other = controller(&storage, &registry);
        let err = other.resolve(Some(id), BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, ResumoError::Closed(_)));
    }

    #[tokio::test]
    async fn registry_miss_probes_storage() {
        let (storage, registry, _tmp) = setup().await;
        let id = {
            let mut writer = controller(&storage, &Arc::new(SessionRegistry::new()));
            writer.resolve(None, BTreeMap::new()).await.unwrap()
        };
        assert!(registry.lookup(&id).is_none());

        let mut ctl = controller(&storage, &registry);
        ctl.resolve(Some(id.clone()), BTreeMap::new()).await.unwrap();
        assert!(registry.lookup(&id).is_some());
    }

    #[tokio::test]
    async fn metadata_updates_persist() {
        let (storage, registry, _tmp) = setup().await;
        let mut ctl = controller(&storage, &registry);
        let id = ctl.resolve(None, BTreeMap::new()).await.unwrap();
        ctl.set_metadata("title", "design review").await.unwrap();
        ctl.suspend();

        let record = storage.read_all(&id).await.unwrap();
        assert_eq!(record.metadata["title"], "design review");
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
        }
    }

    fn bound_handle(ctl: &mut SessionController) -> &mut StorageHandle {
        ctl.handle.as_mut().unwrap()
    }

    #[tokio::test]
    async fn transient_append_failures_are_retried() {
        let (storage, registry, _tmp) = setup().await;
        let mut ctl = SessionController::new(storage.clone(), registry.clone(), fast_retry(3));
        let id = ctl.resolve(None, BTreeMap::new()).await.unwrap();

        let handle = bound_handle(&mut ctl);
        handle.inject_fault(std::io::ErrorKind::Interrupted);
        handle.inject_fault(std::io::ErrorKind::TimedOut);
        let turn = ctl.append(Role::User, "eventually".into()).await.unwrap();
        assert_eq!(turn.sequence, 0);
        assert_eq!(bound_handle(&mut ctl).pending_faults(), 0);
        ctl.suspend();

        let record = storage.read_all(&id).await.unwrap();
        assert_eq!(record.turn_count(), 1);
        assert_eq!(record.turns[0].text(), Some("eventually"));
    }

    #[tokio::test]
    async fn retries_stop_at_max_retries() {
        let (storage, registry, _tmp) = setup().await;
        let mut ctl = SessionController::new(storage.clone(), registry.clone(), fast_retry(2));
        let id = ctl.resolve(None, BTreeMap::new()).await.unwrap();

        let handle = bound_handle(&mut ctl);
        for _ in 0..4 {
            handle.inject_fault(std::io::ErrorKind::Interrupted);
        }
        let err = ctl.append(Role::User, "never".into()).await.unwrap_err();
        assert!(err.is_transient());
        // One attempt plus two retries.
        assert_eq!(bound_handle(&mut ctl).pending_faults(), 1);
        assert_eq!(ctl.record().unwrap().next_sequence(), 0);

        // The leftover fault is absorbed by a retry.
        let turn = ctl.append(Role::User, "later".into()).await.unwrap();
        assert_eq!(turn.sequence, 0);
        ctl.suspend();

        let record = storage.read_all(&id).await.unwrap();
        assert_eq!(record.turn_count(), 1);
        assert_eq!(record.turns[0].text(), Some("later"));
    }

    #[tokio::test]
    async fn non_transient_failures_are_not_retried() {
        let (storage, registry, _tmp) = setup().await;
        let mut ctl = SessionController::new(storage.clone(), registry.clone(), fast_retry(5));
        ctl.resolve(None, BTreeMap::new()).await.unwrap();

        let handle = bound_handle(&mut ctl);
        handle.inject_fault(std::io::ErrorKind::PermissionDenied);
        handle.inject_fault(std::io::ErrorKind::Interrupted);
        let err = ctl.append(Role::User, "denied".into()).await.unwrap_err();
        assert!(matches!(
            err,
            ResumoError::StorageIo(ref e) if e.kind() == std::io::ErrorKind::PermissionDenied
        ));
        assert_eq!(bound_handle(&mut ctl).pending_faults(), 1);
    }
}
