//! Background subsystem that migrates finalized local shuffle partition files to a
//! remote storage tier, keeping local disks below configured watermarks.

pub mod builder;
pub mod disk_item;
pub mod error;
pub mod metrics;
pub mod selection;
pub mod types;
pub mod upload_handler;
pub mod uploader;

pub use builder::{RemoteStorageType, ShuffleUploaderBuilder, ShuffleUploaderConfig};
pub use disk_item::{DiskItem, DiskItemConfig};
pub use error::{UploaderError, UploaderResult};
pub use metrics::{NoopMetrics, UploadMetrics};
pub use types::{PartitionId, ShuffleFileInfo, ShuffleKey, ShufflePartitionFiles, ShuffleUploadResult};
pub use upload_handler::{LocalUploadHandler, UploadHandler};
pub use uploader::{calculate_upload_time, DeadlineParams, ShuffleUploader};

#[cfg(feature = "hdfs")]
pub use upload_handler::hdfs::HdfsUploadHandler;
