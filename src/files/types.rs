use std::{sync::Arc, time::Duration};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::{runtime::types::ContainerRuntime, store::Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Directory,
}

/// One row of a live directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub absolute_path: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
    pub size_bytes: u64,
    pub modified_at: Option<NaiveDateTime>,
    pub permissions: String,
}

#[derive(Debug, Clone)]
pub struct FilePolicy {
    pub max_write_bytes: u64,
    /// Ceiling on cumulative decompressed bytes while walking an archive.
    pub max_archive_bytes: u64,
    /// How long an exec or archive stream may go without producing data.
    pub exec_timeout: Duration,
    /// Final path components that may never be deleted or overwritten.
    pub protected_names: Vec<String>,
}

pub const DEFAULT_PROTECTED_NAMES: &[&str] =
    &["server.jar", "world", "level.dat", ".cubehost.json"];

impl Default for FilePolicy {
    fn default() -> Self {
        FilePolicy {
            max_write_bytes: 100 * 1024 * 1024,
            max_archive_bytes: 1024 * 1024 * 1024,
            exec_timeout: Duration::from_secs(30),
            protected_names: DEFAULT_PROTECTED_NAMES
                .iter()
                .map(|name| name.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub name: String,
    pub content: Vec<u8>,
    /// Directories come back as the raw tar stream.
    pub archive: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractReport {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

/// File operations against a server's running container.
pub struct FileManager {
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) policy: FilePolicy,
}
