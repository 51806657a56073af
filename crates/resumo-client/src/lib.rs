//! Session-persistent conversation client.
//!
//! Wraps an opaque conversational channel so that every turn and every
//! assembled response is durably recorded, and any session can be resumed
//! after a restart.
//!
//! # Main types
//!
//! - [`SessionClient`]: Starts, resumes and administers sessions.
//! - [`BoundSession`]: A session held exclusively by this caller; submits turns.
//! - [`ConversationChannel`]: The seam to the external conversational service.
//! - [`StreamEvent`] / [`TurnEvent`]: Channel-side and caller-side response events.
//! - [`ResumoConfig`]: The `resumo.toml` configuration file.

/// Assembly of streamed response chunks.
pub mod buffer;
/// Conversational channel trait and implementations.
pub mod channels;
pub mod client;
/// The `resumo.toml` file.
pub mod config;
/// Channel-side response events.
pub mod stream;

pub use buffer::TurnBuffer;
pub use channels::{CommandChannel, ConversationChannel, EchoChannel, SessionContext};
pub use client::{BoundSession, ChunkStream, SessionClient, TurnEvent, WORKING_DIRECTORY_KEY};
pub use config::{ChannelConfig, ChannelKind, ResumoConfig};
pub use stream::StreamEvent;
