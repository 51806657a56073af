//! Session persistence and resumption.
//!
//! Sessions are stored as checksum-framed append logs, one file per session, at
//! `<data_dir>/sessions/<session_id>.session`, with a sibling `.lock` file that
//! carries the exclusive per-session writer lock.

pub mod codec;
/// `[storage]` configuration.
pub mod config;
pub mod lifecycle;
/// In-memory index of stored sessions.
pub mod registry;
/// Backoff policy for transient append failures.
pub mod retry;
pub mod storage;

pub use config::{StorageConfig, SyncMode};
pub use lifecycle::{SessionController, SessionState};
pub use registry::{RegistryEntry, SessionRegistry};
pub use retry::RetryPolicy;
pub use storage::{FileStorage, StorageHandle, StoredSession};
