use std::collections::HashMap;
use std::sync::Arc;

use crate::disk_item::DiskItem;
use crate::error::{UploaderError, UploaderResult};
use crate::metrics::{NoopMetrics, UploadMetrics};
use crate::upload_handler::UploadHandler;
use crate::uploader::{DeadlineParams, ShuffleUploader, UploaderConfig};

/// Which remote tier a built uploader writes to. The core only needs to know this is
/// present; the actual client is supplied separately as an `UploadHandler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStorageType {
    Hdfs,
    Local,
}

/// Fully validated construction parameters for a `ShuffleUploader`. Building this
/// directly (rather than through `ShuffleUploaderBuilder`) is fine — both paths run
/// through `validate`, so neither can skip it.
#[derive(Debug, Clone)]
pub struct ShuffleUploaderConfig {
    pub upload_thread_num: usize,
    pub upload_interval_ms: u64,
    pub upload_combine_threshold_mb: u64,
    pub reference_upload_speed_mbs: f64,
    pub remote_storage_type: RemoteStorageType,
    pub hdfs_base_path: String,
    pub server_id: String,
    pub hadoop_conf: HashMap<String, String>,
    pub max_shuffle_size: u64,
    pub max_force_upload_expire_time_s: u64,
}

impl ShuffleUploaderConfig {
    pub fn validate(&self) -> UploaderResult<()> {
        if self.upload_thread_num == 0 {
            return Err(UploaderError::config("uploadThreadNum must be positive"));
        }
        if self.upload_interval_ms == 0 {
            return Err(UploaderError::config("uploadIntervalMS must be positive"));
        }
        if self.upload_combine_threshold_mb == 0 {
            return Err(UploaderError::config(
                "uploadCombineThresholdMB must be positive",
            ));
        }
        if self.reference_upload_speed_mbs <= 0.0 {
            return Err(UploaderError::config(
                "referenceUploadSpeedMBS must be positive",
            ));
        }
        if !self.hdfs_base_path.starts_with("hdfs://") || self.hdfs_base_path == "hdfs://" {
            return Err(UploaderError::config(
                "hdfsBasePath must look like hdfs://<nonempty>",
            ));
        }
        if self.server_id.is_empty() {
            return Err(UploaderError::config("serverId must not be empty"));
        }
        if self.max_shuffle_size == 0 {
            return Err(UploaderError::config("maxShuffleSize must be positive"));
        }
        if self.max_force_upload_expire_time_s == 0 {
            return Err(UploaderError::config(
                "maxForceUploadExpireTimeS must be positive",
            ));
        }
        Ok(())
    }
}

/// Fluent sugar over `ShuffleUploaderConfig`. Every `build()` call still runs
/// `validate()` — there is no way to skip it by going through the builder.
#[derive(Default)]
pub struct ShuffleUploaderBuilder {
    disk_item: Option<Arc<DiskItem>>,
    handler: Option<Arc<dyn UploadHandler>>,
    metrics: Option<Arc<dyn UploadMetrics>>,
    upload_thread_num: Option<usize>,
    upload_interval_ms: Option<u64>,
    upload_combine_threshold_mb: Option<u64>,
    reference_upload_speed_mbs: Option<f64>,
    remote_storage_type: Option<RemoteStorageType>,
    hdfs_base_path: Option<String>,
    server_id: Option<String>,
    hadoop_conf: Option<HashMap<String, String>>,
    max_shuffle_size: Option<u64>,
    max_force_upload_expire_time_s: Option<u64>,
}

impl ShuffleUploaderBuilder {
    pub fn new() -> Self {
        ShuffleUploaderBuilder::default()
    }

    pub fn disk_item(mut self, disk_item: Arc<DiskItem>) -> Self {
        self.disk_item = Some(disk_item);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn UploadHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Optional metrics sink; defaults to `NoopMetrics` if never called.
    pub fn metrics(mut self, metrics: Arc<dyn UploadMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn upload_thread_num(mut self, n: usize) -> Self {
        self.upload_thread_num = Some(n);
        self
    }

    pub fn upload_interval_ms(mut self, ms: u64) -> Self {
        self.upload_interval_ms = Some(ms);
        self
    }

    pub fn upload_combine_threshold_mb(mut self, mb: u64) -> Self {
        self.upload_combine_threshold_mb = Some(mb);
        self
    }

    pub fn reference_upload_speed_mbs(mut self, mbs: f64) -> Self {
        self.reference_upload_speed_mbs = Some(mbs);
        self
    }

    pub fn remote_storage_type(mut self, kind: RemoteStorageType) -> Self {
        self.remote_storage_type = Some(kind);
        self
    }

    pub fn hdfs_base_path(mut self, path: impl Into<String>) -> Self {
        self.hdfs_base_path = Some(path.into());
        self
    }

    pub fn server_id(mut self, id: impl Into<String>) -> Self {
        self.server_id = Some(id.into());
        self
    }

    pub fn hadoop_conf(mut self, conf: HashMap<String, String>) -> Self {
        self.hadoop_conf = Some(conf);
        self
    }

    pub fn max_shuffle_size(mut self, bytes: u64) -> Self {
        self.max_shuffle_size = Some(bytes);
        self
    }

    pub fn max_force_upload_expire_time_s(mut self, secs: u64) -> Self {
        self.max_force_upload_expire_time_s = Some(secs);
        self
    }

    pub fn build(self) -> UploaderResult<Arc<ShuffleUploader>> {
        let disk_item = self
            .disk_item
            .ok_or_else(|| UploaderError::config("diskItem is required"))?;
        let handler = self
            .handler
            .ok_or_else(|| UploaderError::config("an UploadHandler is required"))?;

        let config = ShuffleUploaderConfig {
            upload_thread_num: self
                .upload_thread_num
                .ok_or_else(|| UploaderError::config("uploadThreadNum is required"))?,
            upload_interval_ms: self
                .upload_interval_ms
                .ok_or_else(|| UploaderError::config("uploadIntervalMS is required"))?,
            upload_combine_threshold_mb: self
                .upload_combine_threshold_mb
                .ok_or_else(|| UploaderError::config("uploadCombineThresholdMB is required"))?,
            reference_upload_speed_mbs: self
                .reference_upload_speed_mbs
                .ok_or_else(|| UploaderError::config("referenceUploadSpeedMBS is required"))?,
            remote_storage_type: self
                .remote_storage_type
                .ok_or_else(|| UploaderError::config("remoteStorageType is required"))?,
            hdfs_base_path: self
                .hdfs_base_path
                .ok_or_else(|| UploaderError::config("hdfsBasePath is required"))?,
            server_id: self
                .server_id
                .ok_or_else(|| UploaderError::config("serverId is required"))?,
            hadoop_conf: self
                .hadoop_conf
                .ok_or_else(|| UploaderError::config("hadoopConf is required"))?,
            max_shuffle_size: self
                .max_shuffle_size
                .ok_or_else(|| UploaderError::config("maxShuffleSize is required"))?,
            max_force_upload_expire_time_s: self
                .max_force_upload_expire_time_s
                .ok_or_else(|| UploaderError::config("maxForceUploadExpireTimeS is required"))?,
        };
        config.validate()?;

        let internal = UploaderConfig {
            server_id: config.server_id.clone(),
            hdfs_base_path: config.hdfs_base_path.clone(),
            upload_thread_num: config.upload_thread_num,
            upload_interval_ms: config.upload_interval_ms,
            max_shuffle_size: config.max_shuffle_size,
            deadline: DeadlineParams {
                reference_upload_speed_mbs: config.reference_upload_speed_mbs,
                upload_thread_num: config.upload_thread_num,
                max_force_upload_expire_time_s: config.max_force_upload_expire_time_s,
            },
        };

        let metrics: Arc<dyn UploadMetrics> = self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics));
        Ok(ShuffleUploader::with_metrics(internal, disk_item, handler, metrics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk_item::DiskItemConfig;
    use crate::upload_handler::LocalUploadHandler;
    use tempfile::tempdir;

    fn full_builder(tmp: &std::path::Path) -> ShuffleUploaderBuilder {
        let disk_item = DiskItem::new(DiskItemConfig {
            base_path: tmp.to_path_buf(),
            capacity: 1_000_000,
            high_water_mark: 0.8,
            low_water_mark: 0.6,
            shuffle_expired_timeout_ms: 60_000,
        });
        ShuffleUploaderBuilder::new()
            .disk_item(disk_item)
            .handler(Arc::new(LocalUploadHandler::new(tmp.join("remote"))))
            .upload_thread_num(2)
            .upload_interval_ms(3)
            .upload_combine_threshold_mb(300)
            .reference_upload_speed_mbs(1.0)
            .remote_storage_type(RemoteStorageType::Hdfs)
            .hdfs_base_path("hdfs://base")
            .server_id("prefix")
            .hadoop_conf(HashMap::new())
            .max_shuffle_size(64 * 1024 * 1024)
            .max_force_upload_expire_time_s(30)
    }

    #[test]
    fn fully_populated_builder_succeeds() {
        let tmp = tempdir().unwrap();
        assert!(full_builder(tmp.path()).build().is_ok());
    }

    #[test]
    fn missing_reference_speed_is_configuration_error() {
        let tmp = tempdir().unwrap();
        let result = ShuffleUploaderBuilder::new()
            .disk_item(DiskItem::new(DiskItemConfig {
                base_path: tmp.path().to_path_buf(),
                capacity: 1,
                high_water_mark: 0.8,
                low_water_mark: 0.6,
                shuffle_expired_timeout_ms: 1,
            }))
            .handler(Arc::new(LocalUploadHandler::new(tmp.path())))
            .upload_thread_num(1)
            .upload_interval_ms(1)
            .upload_combine_threshold_mb(1)
            .remote_storage_type(RemoteStorageType::Hdfs)
            .hdfs_base_path("hdfs://base")
            .server_id("prefix")
            .hadoop_conf(HashMap::new())
            .max_shuffle_size(1)
            .max_force_upload_expire_time_s(1)
            .build();
        assert!(matches!(result, Err(UploaderError::ConfigurationError { .. })));
    }

    #[test]
    fn empty_server_id_is_configuration_error() {
        let tmp = tempdir().unwrap();
        let result = full_builder(tmp.path()).server_id("").build();
        assert!(matches!(result, Err(UploaderError::ConfigurationError { .. })));
    }

    #[test]
    fn zero_max_shuffle_size_is_configuration_error() {
        let tmp = tempdir().unwrap();
        let result = full_builder(tmp.path()).max_shuffle_size(0).build();
        assert!(matches!(result, Err(UploaderError::ConfigurationError { .. })));
    }

    #[test]
    fn malformed_hdfs_base_path_is_configuration_error() {
        let tmp = tempdir().unwrap();
        let result = full_builder(tmp.path()).hdfs_base_path("/not/hdfs").build();
        assert!(matches!(result, Err(UploaderError::ConfigurationError { .. })));
    }
}
