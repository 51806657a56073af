use serde::{Deserialize, Serialize};

/// Events produced by a conversational channel while it answers one turn.
///
/// A well-behaved channel emits any number of content events followed by
/// exactly one `Done` or `Error`. A channel that closes its sender without
/// either is treated as having failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A chunk of response text.
    TextDelta {
        /// The chunk, passed through unchanged.
        text: String,
    },

    /// A structured content block, stored verbatim.
    Block {
        /// The block as the channel produced it.
        content: serde_json::Value,
    },

    /// End of turn.
    Done,

    /// The channel failed mid-turn.
    Error {
        /// Why the turn failed.
        message: String,
    },
}
