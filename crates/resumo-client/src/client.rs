//! The session-persistent client.
//!
//! [`SessionClient`] owns storage, the registry and the conversational channel.
//! Binding a session yields a [`BoundSession`], which holds the session's
//! exclusive lock until it is closed, suspended or dropped.

use crate::buffer::TurnBuffer;
use crate::channels::{ConversationChannel, SessionContext};
use crate::config::ResumoConfig;
use crate::stream::StreamEvent;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use resumo_core::{
    ResumoError, ResumoResult, Role, SessionId, SessionRecord, SessionSummary, Turn,
};
use resumo_session::{FileStorage, RetryPolicy, SessionController, SessionRegistry, SessionState};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

/// Metadata key recording the directory a session was started from.
pub const WORKING_DIRECTORY_KEY: &str = "working_directory";

/// What the caller sees while a turn's response streams in.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// A text chunk, forwarded as soon as the channel produced it.
    Text(String),
    /// A structured content block.
    Block(Value),
    /// The assembled response, durably appended. Always the last item of a
    /// successful turn.
    Committed(Turn),
}

/// Lazy, single-use stream of one turn's response.
///
/// Ends after `Committed` or after the first error. Dropping it early discards
/// the partial response; nothing of it is persisted.
pub type ChunkStream<'a> = BoxStream<'a, ResumoResult<TurnEvent>>;

/// Entry point: starts, resumes and administers sessions.
pub struct SessionClient {
    storage: Arc<FileStorage>,
    registry: Arc<SessionRegistry>,
    channel: Arc<dyn ConversationChannel>,
    retry: RetryPolicy,
}

impl SessionClient {
    /// Builds a client and populates its registry from storage.
    pub async fn new(
        storage: FileStorage,
        channel: Arc<dyn ConversationChannel>,
        retry: RetryPolicy,
    ) -> ResumoResult<Self> {
        let storage = Arc::new(storage);
        let registry = Arc::new(SessionRegistry::build(&storage).await?);
        Ok(Self {
            storage,
            registry,
            channel,
            retry,
        })
    }

    /// Builds storage and channel from `config`, then the client.
    pub async fn from_config(config: &ResumoConfig) -> ResumoResult<Self> {
        let storage = FileStorage::from_config(&config.storage).await?;
        let channel = config.channel.build()?;
        Self::new(storage, channel, config.retry.clone()).await
    }

    /// The backing session store.
    pub fn storage(&self) -> &FileStorage {
        &self.storage
    }

    /// The in-memory session index.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Name of the configured channel, for logs.
    pub fn channel_name(&self) -> &str {
        self.channel.name()
    }

    /// Resumes `id`, or starts a new session when `id` is `None`.
    pub async fn start_or_resume_session(
        &self,
        id: Option<SessionId>,
    ) -> ResumoResult<BoundSession> {
        self.start_or_resume_session_with(id, BTreeMap::new()).await
    }

    /// Like [`start_or_resume_session`](Self::start_or_resume_session), recording
    /// `metadata` (plus the current working directory) if a session is created.
    pub async fn start_or_resume_session_with(
        &self,
        id: Option<SessionId>,
        mut metadata: BTreeMap<String, String>,
    ) -> ResumoResult<BoundSession> {
        if id.is_none() && !metadata.contains_key(WORKING_DIRECTORY_KEY) {
            match std::env::current_dir() {
                Ok(dir) => {
                    metadata.insert(WORKING_DIRECTORY_KEY.into(), dir.display().to_string());
                }
                Err(e) => debug!(error = %e, "Working directory unavailable"),
            }
        }

        let mut controller = SessionController::new(
            self.storage.clone(),
            self.registry.clone(),
            self.retry.clone(),
        );
        let id = controller.resolve(id, metadata).await?;
        Ok(BoundSession {
            id,
            controller,
            channel: self.channel.clone(),
        })
    }

    /// Summaries of every readable session, sorted by id. Corrupt records are skipped.
    pub async fn list_sessions(&self) -> ResumoResult<Vec<SessionSummary>> {
        Ok(self
            .storage
            .list()
            .await?
            .into_iter()
            .map(|stored| stored.summary)
            .collect())
    }

    /// Reads a full record without binding the session.
    pub async fn load_session(&self, id: &SessionId) -> ResumoResult<SessionRecord> {
        self.storage.read_all(id).await
    }

    /// Deletes a session. Returns `false` if it did not exist.
    pub async fn delete_session(&self, id: &SessionId) -> ResumoResult<bool> {
        let deleted = self.storage.delete(id).await?;
        self.registry.remove(id);
        Ok(deleted)
    }

    /// Administratively closes a session that is not currently bound elsewhere.
    pub async fn close_session(&self, id: &SessionId) -> ResumoResult<()> {
        let mut session = self.start_or_resume_session(Some(id.clone())).await?;
        session.controller.close().await
    }

    /// Deletes every session last active before `cutoff`.
    ///
    /// Sessions bound by another writer are skipped. Returns the deleted ids.
    pub async fn expire_sessions(&self, cutoff: DateTime<Utc>) -> ResumoResult<Vec<SessionId>> {
        let mut expired = Vec::new();
        for stored in self.storage.list().await? {
            if stored.summary.last_active_at >= cutoff {
                continue;
            }
            let id = stored.summary.id;
            match self.storage.delete(&id).await {
                Ok(deleted) => {
                    self.registry.remove(&id);
                    if deleted {
                        expired.push(id);
                    }
                }
                Err(ResumoError::SessionLocked(_)) => {
                    warn!(session_id = %id, "Session in use, not expiring");
                }
                Err(e) => return Err(e),
            }
        }
        info!(expired = expired.len(), cutoff = %cutoff, "Expired idle sessions");
        Ok(expired)
    }

    /// Re-scans storage into the registry.
    pub async fn rebuild_registry(&self) -> ResumoResult<usize> {
        self.registry.rebuild(&self.storage).await
    }
}

/// A session bound to this caller.
///
/// Holds the exclusive writer lock. The lock is released on [`close`](Self::close),
/// [`suspend`](Self::suspend) or drop, whichever comes first.
pub struct BoundSession {
    id: SessionId,
    controller: SessionController,
    channel: Arc<dyn ConversationChannel>,
}

impl BoundSession {
    /// Identifier of the bound session.
    pub fn session_id(&self) -> &SessionId {
        &self.id
    }

    /// Whether the session existed before it was bound.
    pub fn is_resumed(&self) -> bool {
        self.controller.is_resumed()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.controller.state()
    }

    /// The committed record.
    pub fn record(&self) -> Option<&SessionRecord> {
        self.controller.record()
    }

    /// Persists `content` as a user turn, sends it to the channel and returns
    /// the response stream.
    ///
    /// The assistant turn is appended once the channel signals end of turn and
    /// reported as [`TurnEvent::Committed`]. A channel failure yields
    /// `ResumoError::Channel` and leaves no assistant turn behind.
    pub async fn submit_turn(
        &mut self,
        content: impl Into<Value>,
    ) -> ResumoResult<ChunkStream<'_>> {
        self.submit_turn_as(Role::User, content).await
    }

    /// Like [`submit_turn`](Self::submit_turn), with the submitted turn
    /// persisted under `role`, e.g. a tool result handed back to the channel.
    pub async fn submit_turn_as(
        &mut self,
        role: Role,
        content: impl Into<Value>,
    ) -> ResumoResult<ChunkStream<'_>> {
        let content = content.into();
        let submitted = self.controller.append(role, content.clone()).await?;

        let record = self
            .controller
            .record()
            .ok_or_else(|| ResumoError::InvalidState("session is no longer bound".into()))?;
        let ctx = SessionContext {
            session_id: &self.id,
            resumed: self.controller.is_resumed(),
            history: &record.turns[..record.turns.len().saturating_sub(1)],
            metadata: &record.metadata,
        };
        let events = match self.channel.send(ctx, &content).await {
            Ok(events) => events,
            Err(e) => {
                error!(
                    session_id = %self.id,
                    channel = self.channel.name(),
                    error = %e,
                    "Channel rejected turn"
                );
                return Err(e);
            }
        };
        debug!(
            session_id = %self.id,
            sequence = submitted.sequence,
            role = %role,
            channel = self.channel.name(),
            "Turn sent"
        );

        let pending = PendingTurn {
            id: self.id.clone(),
            controller: &mut self.controller,
            events: ReceiverStream::new(events),
            buffer: TurnBuffer::new(),
            settled: false,
        };
        Ok(stream::unfold(Some(pending), next_event).boxed())
    }

    /// Submits a turn and drives its response to completion.
    pub async fn submit_turn_collect(&mut self, content: impl Into<Value>) -> ResumoResult<Turn> {
        let mut chunks = self.submit_turn(content).await?;
        while let Some(event) = chunks.next().await {
            if let TurnEvent::Committed(turn) = event? {
                return Ok(turn);
            }
        }
        Err(ResumoError::Channel(
            "turn ended without a committed response".into(),
        ))
    }

    /// Appends a turn without sending it to the channel.
    ///
    /// For turns the channel never sees live, such as a system prompt or a
    /// tool result produced locally. The turn is part of the history handed
    /// to the channel on the next submit.
    pub async fn record_turn(
        &mut self,
        role: Role,
        content: impl Into<Value>,
    ) -> ResumoResult<Turn> {
        let turn = self.controller.append(role, content.into()).await?;
        debug!(session_id = %self.id, sequence = turn.sequence, role = %role, "Turn recorded");
        Ok(turn)
    }

    /// Sets one metadata entry and persists it.
    pub async fn set_metadata(&mut self, key: &str, value: &str) -> ResumoResult<()> {
        self.controller.set_metadata(key, value).await
    }

    /// Closes the session for good; it can no longer be resumed.
    pub async fn close(mut self) -> ResumoResult<()> {
        self.controller.close().await
    }

    /// Releases the session so it can be resumed later.
    pub fn suspend(mut self) {
        self.controller.suspend();
    }
}

/// One in-flight response.
struct PendingTurn<'a> {
    id: SessionId,
    controller: &'a mut SessionController,
    events: ReceiverStream<StreamEvent>,
    buffer: TurnBuffer,
    settled: bool,
}

impl PendingTurn<'_> {
    async fn commit(&mut self) -> ResumoResult<TurnEvent> {
        self.settled = true;
        let content = std::mem::take(&mut self.buffer).into_content();
        let turn = self.controller.append(Role::Assistant, content).await?;
        debug!(session_id = %self.id, sequence = turn.sequence, "Response committed");
        Ok(TurnEvent::Committed(turn))
    }

    fn abandon(&mut self, reason: &str) {
        self.settled = true;
        let discarded = self.buffer.discard();
        error!(session_id = %self.id, error = reason, "Channel failed mid-turn");
        warn!(
            session_id = %self.id,
            discarded_chunks = discarded,
            "Discarded partial assistant response"
        );
    }
}

impl Drop for PendingTurn<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let discarded = self.buffer.discard();
            warn!(
                session_id = %self.id,
                discarded_chunks = discarded,
                "Turn cancelled before end of turn, partial response discarded"
            );
        }
    }
}

async fn next_event<'a>(
    pending: Option<PendingTurn<'a>>,
) -> Option<(ResumoResult<TurnEvent>, Option<PendingTurn<'a>>)> {
    let mut pending = pending?;
    match pending.events.next().await {
        Some(StreamEvent::TextDelta { text }) => {
            pending.buffer.push_text(&text);
            Some((Ok(TurnEvent::Text(text)), Some(pending)))
        }
        Some(StreamEvent::Block { content }) => {
            pending.buffer.push_block(content.clone());
            Some((Ok(TurnEvent::Block(content)), Some(pending)))
        }
        Some(StreamEvent::Done) => Some((pending.commit().await, None)),
        Some(StreamEvent::Error { message }) => {
            pending.abandon(&message);
            Some((Err(ResumoError::Channel(message)), None))
        }
        None => {
            let message = String::from("channel closed before end of turn");
            pending.abandon(&message);
            Some((Err(ResumoError::Channel(message)), None))
        }
    }
}
