use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The role of the participant that authored a [`Turn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A human end-user.
    User,
    /// The AI assistant.
    Assistant,
    /// A system-level instruction or prompt.
    System,
    /// Output produced by a tool invocation.
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        };
        f.write_str(s)
    }
}

/// One exchange unit within a session.
///
/// `content` is stored verbatim: a JSON string for plain text, or whatever
/// structured value the conversational channel produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Position of this turn in its session, starting at 0 with no gaps.
    pub sequence: u64,
    /// The role of the turn's author.
    pub role: Role,
    /// Opaque payload.
    pub content: serde_json::Value,
    /// UTC timestamp of when the turn was committed.
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    /// Creates a turn stamped with the current time.
    pub fn new(sequence: u64, role: Role, content: impl Into<serde_json::Value>) -> Self {
        Self {
            sequence,
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// The content as text, when it is a plain string.
    pub fn text(&self) -> Option<&str> {
        self.content.as_str()
    }
}
