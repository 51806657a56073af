use crate::channels::{CommandChannel, ConversationChannel, EchoChannel};
use resumo_core::{ResumoError, ResumoResult};
use resumo_session::{RetryPolicy, StorageConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Which [`ConversationChannel`] implementation to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Replays every turn back; needs no external service.
    #[default]
    Echo,
    /// Runs an external program per turn (stdin in, stdout out).
    Command,
}

/// `[channel]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel implementation, `echo` by default.
    #[serde(default)]
    pub kind: ChannelKind,
    /// Program to run for the `command` channel.
    #[serde(default)]
    pub program: Option<String>,
    /// Arguments; `{session_id}` is replaced with the bound session.
    #[serde(default)]
    pub args: Vec<String>,
}

impl ChannelConfig {
    /// Instantiates the configured channel.
    pub fn build(&self) -> ResumoResult<Arc<dyn ConversationChannel>> {
        match self.kind {
            ChannelKind::Echo => Ok(Arc::new(EchoChannel::new())),
            ChannelKind::Command => {
                let program = self
                    .program
                    .as_deref()
                    .filter(|p| !p.trim().is_empty())
                    .ok_or_else(|| {
                        ResumoError::Config(
                            "channel.kind = \"command\" requires channel.program".into(),
                        )
                    })?;
                Ok(Arc::new(CommandChannel::new(program, self.args.clone())))
            }
        }
    }
}

/// Top-level configuration file (`resumo.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumoConfig {
    /// `[storage]`: data directory and sync mode.
    #[serde(default)]
    pub storage: StorageConfig,
    /// `[retry]`: append retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// `[channel]`: the conversational channel.
    #[serde(default)]
    pub channel: ChannelConfig,
}

impl ResumoConfig {
    /// Loads a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> ResumoResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text)
                .map_err(|e| ResumoError::Config(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parses TOML text.
    pub fn parse(text: &str) -> ResumoResult<Self> {
        toml::from_str(text).map_err(|e| ResumoError::Config(e.to_string()))
    }
}
