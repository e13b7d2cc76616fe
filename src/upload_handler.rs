use std::fs;
use std::path::Path;

use log::debug;

use crate::types::{PartitionId, ShuffleFileInfo, ShuffleUploadResult};

/// The pluggable remote sink a `ShuffleUploader` writes batches through.
///
/// Implementations own the network/filesystem client; the core only ever sees
/// the batch in and the result out.
pub trait UploadHandler: Send + Sync {
    fn upload(&self, batch: &ShuffleFileInfo) -> ShuffleUploadResult;
}

/// Copies a batch's files into a destination directory tree. The only handler this
/// crate guarantees is available without extra native dependencies; used for local
/// development and as the reference implementation the test scenarios run against.
pub struct LocalUploadHandler {
    dest_root: std::path::PathBuf,
}

impl LocalUploadHandler {
    pub fn new(dest_root: impl Into<std::path::PathBuf>) -> Self {
        LocalUploadHandler {
            dest_root: dest_root.into(),
        }
    }

    fn dest_dir(&self, batch: &ShuffleFileInfo) -> std::path::PathBuf {
        self.dest_root.join(
            batch
                .remote_prefix
                .trim_start_matches('/')
                .replace("://", "/"),
        )
    }

    fn copy_one(&self, src: &Path, dest_dir: &Path) -> std::io::Result<u64> {
        fs::create_dir_all(dest_dir)?;
        let file_name = src.file_name().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "missing file name")
        })?;
        fs::copy(src, dest_dir.join(file_name))
    }
}

impl UploadHandler for LocalUploadHandler {
    fn upload(&self, batch: &ShuffleFileInfo) -> ShuffleUploadResult {
        let dest_dir = self.dest_dir(batch);
        let mut uploaded_bytes = 0u64;
        let mut uploaded_partition_ids: Vec<PartitionId> = Vec::new();

        for ((data, index), &partition_id) in batch
            .data_files
            .iter()
            .zip(batch.index_files.iter())
            .zip(batch.partition_ids.iter())
        {
            let result = self
                .copy_one(data, &dest_dir)
                .and_then(|bytes| self.copy_one(index, &dest_dir).map(|_| bytes));
            match result {
                Ok(bytes) => {
                    uploaded_bytes += bytes;
                    uploaded_partition_ids.push(partition_id);
                }
                Err(err) => {
                    debug!(
                        target: "upload_handler::local",
                        "failed to copy partition {partition_id} of {}: {err}",
                        batch.key
                    );
                }
            }
        }

        ShuffleUploadResult {
            uploaded_bytes,
            uploaded_partition_ids,
        }
    }
}

#[cfg(feature = "hdfs")]
pub mod hdfs {
    use super::*;
    use hdfs_native::Client;
    use log::warn;
    use tokio::runtime::Runtime;

    /// Writes batches to a real HDFS cluster via `hdfs-native`. Gated behind the
    /// `hdfs` feature so the default build carries no Hadoop-native linkage.
    pub struct HdfsUploadHandler {
        client: Client,
        runtime: Runtime,
    }

    impl HdfsUploadHandler {
        pub fn new(name_node_url: &str) -> anyhow::Result<Self> {
            let client = Client::new(name_node_url)?;
            let runtime = Runtime::new()?;
            Ok(HdfsUploadHandler { client, runtime })
        }

        async fn upload_one(&self, batch: &ShuffleFileInfo, idx: usize) -> std::io::Result<u64> {
            let data_path = &batch.data_files[idx];
            let index_path = &batch.index_files[idx];
            let data_bytes = tokio::fs::read(data_path).await?;
            let index_bytes = tokio::fs::read(index_path).await?;

            let data_name = data_path.file_name().unwrap().to_string_lossy();
            let index_name = index_path.file_name().unwrap().to_string_lossy();
            let remote_data = format!("{}/{}", batch.remote_prefix, data_name);
            let remote_index = format!("{}/{}", batch.remote_prefix, index_name);

            let len = data_bytes.len() as u64;
            self.write_file(&remote_data, &data_bytes)
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            self.write_file(&remote_index, &index_bytes)
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            Ok(len)
        }

        async fn write_file(&self, path: &str, bytes: &[u8]) -> hdfs_native::Result<()> {
            let mut writer = self.client.create(path, Default::default()).await?;
            writer.write(bytes.to_vec().into()).await?;
            writer.close().await?;
            Ok(())
        }
    }

    impl UploadHandler for HdfsUploadHandler {
        fn upload(&self, batch: &ShuffleFileInfo) -> ShuffleUploadResult {
            let mut uploaded_bytes = 0u64;
            let mut uploaded_partition_ids = Vec::new();

            for idx in 0..batch.data_files.len() {
                let partition_id = batch.partition_ids[idx];
                match self.runtime.block_on(self.upload_one(batch, idx)) {
                    Ok(bytes) => {
                        uploaded_bytes += bytes;
                        uploaded_partition_ids.push(partition_id);
                    }
                    Err(err) => {
                        warn!(
                            target: "upload_handler::hdfs",
                            "failed to upload partition {partition_id} of {}: {err}",
                            batch.key
                        );
                    }
                }
            }

            ShuffleUploadResult {
                uploaded_bytes,
                uploaded_partition_ids,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ShuffleKey;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_file(path: &Path, content: &[u8]) {
        let mut f = File::create(path).unwrap();
        f.write_all(content).unwrap();
    }

    #[test]
    fn local_handler_copies_all_pairs() {
        let src = tempdir().unwrap();
        let dest = tempdir().unwrap();
        let data_path = src.path().join("1.data");
        let index_path = src.path().join("1.index");
        write_file(&data_path, b"0123456789");
        write_file(&index_path, b"idx");

        let key = ShuffleKey::new("app-1", "1");
        let batch = ShuffleFileInfo {
            key: key.clone(),
            server_id: "server-a".to_string(),
            data_files: vec![data_path],
            index_files: vec![index_path],
            partition_ids: vec![1],
            total_bytes: 10,
            remote_prefix: crate::types::remote_prefix("hdfs://base", "server-a", &key),
        };

        let handler = LocalUploadHandler::new(dest.path());
        let result = handler.upload(&batch);
        assert_eq!(result.uploaded_bytes, 10);
        assert_eq!(result.uploaded_partition_ids, vec![1]);
    }

    #[test]
    fn local_handler_skips_missing_source_file() {
        let dest = tempdir().unwrap();
        let key = ShuffleKey::new("app-1", "1");
        let batch = ShuffleFileInfo {
            key: key.clone(),
            server_id: "server-a".to_string(),
            data_files: vec![std::path::PathBuf::from("/nonexistent/1.data")],
            index_files: vec![std::path::PathBuf::from("/nonexistent/1.index")],
            partition_ids: vec![1],
            total_bytes: 10,
            remote_prefix: crate::types::remote_prefix("hdfs://base", "server-a", &key),
        };

        let handler = LocalUploadHandler::new(dest.path());
        let result = handler.upload(&batch);
        assert_eq!(result.uploaded_bytes, 0);
        assert!(result.uploaded_partition_ids.is_empty());
    }
}
