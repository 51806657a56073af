use crate::error::{ResumoError, ResumoResult};
use crate::turn::Turn;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const MAX_ID_LEN: usize = 128;

/// Opaque session identifier.
///
/// Identifiers double as storage file names, so only ASCII letters, digits,
/// `-`, `_` and `.` are accepted, and a leading `.` is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh, globally unique identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Validates a caller-supplied identifier.
    pub fn parse(raw: impl Into<String>) -> ResumoResult<Self> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > MAX_ID_LEN {
            return Err(ResumoError::Config(format!(
                "session id must be 1..={MAX_ID_LEN} characters"
            )));
        }
        if raw.starts_with('.') {
            return Err(ResumoError::Config(format!(
                "session id must not start with '.': {raw}"
            )));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(ResumoError::Config(format!(
                "session id contains invalid character {bad:?}: {raw}"
            )));
        }
        Ok(Self(raw))
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = ResumoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SessionId {
    type Error = ResumoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

/// The durable unit of state for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    /// Stable identifier, the sole storage key.
    pub id: SessionId,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the session last persisted anything. Never decreases.
    pub last_active_at: DateTime<Utc>,
    /// Turns in chronological (= sequence) order.
    pub turns: Vec<Turn>,
    /// Free-form client-supplied tags.
    pub metadata: BTreeMap<String, String>,
    /// Set once the session has been administratively closed.
    pub closed_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// Creates an empty record stamped with the current time.
    pub fn new(id: SessionId, metadata: BTreeMap<String, String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            last_active_at: now,
            turns: Vec::new(),
            metadata,
            closed_at: None,
        }
    }

    /// The sequence number the next appended turn must carry.
    pub fn next_sequence(&self) -> u64 {
        self.turns.last().map_or(0, |t| t.sequence + 1)
    }

    /// Number of committed turns.
    pub fn turn_count(&self) -> u64 {
        self.turns.len() as u64
    }

    /// Whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    /// Appends a turn, enforcing gap-free sequence numbers.
    pub fn push_turn(&mut self, turn: Turn) -> ResumoResult<()> {
        let expected = self.next_sequence();
        if turn.sequence != expected {
            return Err(ResumoError::Corrupt {
                id: self.id.to_string(),
                reason: format!(
                    "turn sequence {} out of order (expected {expected})",
                    turn.sequence
                ),
            });
        }
        self.touch(turn.timestamp);
        self.turns.push(turn);
        Ok(())
    }

    /// Advances `last_active_at`, never moving it backwards.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_active_at {
            self.last_active_at = at;
        }
    }

    /// Summary view of this record.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            created_at: self.created_at,
            last_active_at: self.last_active_at,
            turn_count: self.turn_count(),
            closed: self.is_closed(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Per-session metadata returned by listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// The session identifier.
    pub id: SessionId,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the session last persisted anything.
    pub last_active_at: DateTime<Utc>,
    /// Number of committed turns.
    pub turn_count: u64,
    /// Whether the session has been closed.
    pub closed: bool,
    /// Client-supplied tags.
    pub metadata: BTreeMap<String, String>,
}
