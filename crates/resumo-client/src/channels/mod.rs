/// Runs an external program per turn.
pub mod command;
/// Replays turns back.
pub mod echo;

pub use command::CommandChannel;
pub use echo::EchoChannel;

use crate::stream::StreamEvent;
use async_trait::async_trait;
use resumo_core::{ResumoResult, SessionId, Turn};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// What a channel gets to know about the session a turn belongs to.
#[derive(Debug, Clone, Copy)]
pub struct SessionContext<'a> {
    /// The session the turn belongs to.
    pub session_id: &'a SessionId,
    /// `true` when the session existed before this process bound it.
    pub resumed: bool,
    /// Committed turns preceding the one being sent.
    pub history: &'a [Turn],
    /// Session metadata as last persisted.
    pub metadata: &'a BTreeMap<String, String>,
}

/// The external conversational exchange, keyed by session identifier.
///
/// Implementations start producing the response in the background and hand
/// back the receiving end. Dropping the receiver cancels the exchange.
///
/// To add a new channel:
/// 1. Create a new module in `channels/`
/// 2. Implement `ConversationChannel` for your struct
/// 3. Add the variant to `ChannelKind` in `config.rs`
/// 4. Wire it up in `ChannelConfig::build()`
#[async_trait]
pub trait ConversationChannel: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Sends one turn and returns the stream of response events.
    async fn send(
        &self,
        ctx: SessionContext<'_>,
        content: &serde_json::Value,
    ) -> ResumoResult<mpsc::Receiver<StreamEvent>>;
}
