use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Identifies one shuffle within the service: `(appId, shuffleId)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShuffleKey {
    pub app_id: String,
    pub shuffle_id: String,
}

impl ShuffleKey {
    pub fn new(app_id: impl Into<String>, shuffle_id: impl Into<String>) -> Self {
        ShuffleKey {
            app_id: app_id.into(),
            shuffle_id: shuffle_id.into(),
        }
    }
}

impl fmt::Display for ShuffleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app_id, self.shuffle_id)
    }
}

pub type PartitionId = u32;

/// The on-disk data/index pair for one partition of one shuffle, written by one server.
#[derive(Debug, Clone)]
pub struct ShufflePartitionFiles {
    pub key: ShuffleKey,
    pub partition_id: PartitionId,
    pub server_id: String,
    pub data_path: PathBuf,
    pub index_path: PathBuf,
    pub data_bytes: u64,
}

/// One unit of work handed to an upload worker: files from a single shuffle key,
/// bounded by `maxShuffleSize`, destined for a single remote prefix.
#[derive(Debug, Clone)]
pub struct ShuffleFileInfo {
    pub key: ShuffleKey,
    pub server_id: String,
    pub data_files: Vec<PathBuf>,
    pub index_files: Vec<PathBuf>,
    pub partition_ids: Vec<PartitionId>,
    pub total_bytes: u64,
    pub remote_prefix: String,
}

impl ShuffleFileInfo {
    pub fn is_empty(&self) -> bool {
        self.data_files.is_empty()
    }
}

/// What an `UploadHandler` reports back for one batch.
#[derive(Debug, Clone, Default)]
pub struct ShuffleUploadResult {
    pub uploaded_bytes: u64,
    pub uploaded_partition_ids: Vec<PartitionId>,
}

/// Builds the remote destination prefix for a batch: `<hdfsBase>/<serverId>/<key>`.
pub fn remote_prefix(hdfs_base_path: &str, server_id: &str, key: &ShuffleKey) -> String {
    format!(
        "{}/{}/{}/{}",
        hdfs_base_path.trim_end_matches('/'),
        server_id,
        key.app_id,
        key.shuffle_id
    )
}
