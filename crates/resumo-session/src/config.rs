use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// When appended frames are forced to stable storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// fsync after every create and append.
    #[default]
    Always,
    /// Rely on OS buffering.
    Never,
}

impl SyncMode {
    /// Whether writes are followed by an fsync.
    pub fn is_always(self) -> bool {
        self == SyncMode::Always
    }
}

/// `[storage]` section of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root data directory; session logs live in `<data_dir>/sessions`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Durability mode for writes.
    #[serde(default)]
    pub sync: SyncMode,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            sync: SyncMode::default(),
        }
    }
}

impl StorageConfig {
    /// Directory holding the session logs.
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }
}
