use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use shuffle_uploader::{
    DiskItem, DiskItemConfig, LocalUploadHandler, RemoteStorageType, ShuffleUploaderBuilder,
    UploadHandler,
};

#[derive(Parser, Debug)]
#[command(name = "shuffle-uploaderd", about = "Local shuffle file uploader daemon")]
struct Cli {
    #[arg(long, env = "SHUFFLE_DISK_BASE_PATH")]
    base_path: PathBuf,

    #[arg(long, env = "SHUFFLE_DISK_CAPACITY_BYTES")]
    capacity: u64,

    #[arg(long, env = "SHUFFLE_HIGH_WATER_MARK", default_value_t = 0.9)]
    high_water_mark: f64,

    #[arg(long, env = "SHUFFLE_LOW_WATER_MARK", default_value_t = 0.7)]
    low_water_mark: f64,

    #[arg(long, env = "SHUFFLE_EXPIRED_TIMEOUT_MS", default_value_t = 60_000)]
    shuffle_expired_timeout_ms: u64,

    #[arg(long, env = "SHUFFLE_UPLOAD_THREAD_NUM", default_value_t = 4)]
    upload_thread_num: usize,

    #[arg(long, env = "SHUFFLE_UPLOAD_INTERVAL_MS", default_value_t = 5_000)]
    upload_interval_ms: u64,

    #[arg(long, env = "SHUFFLE_UPLOAD_COMBINE_THRESHOLD_MB", default_value_t = 32)]
    upload_combine_threshold_mb: u64,

    #[arg(long, env = "SHUFFLE_REFERENCE_UPLOAD_SPEED_MBS", default_value_t = 128.0)]
    reference_upload_speed_mbs: f64,

    #[arg(long, env = "SHUFFLE_MAX_FORCE_UPLOAD_EXPIRE_TIME_S", default_value_t = 240)]
    max_force_upload_expire_time_s: u64,

    #[arg(long, env = "SHUFFLE_MAX_SHUFFLE_SIZE_BYTES", default_value_t = 268_435_456)]
    max_shuffle_size: u64,

    #[arg(long, env = "SHUFFLE_HDFS_BASE_PATH")]
    hdfs_base_path: String,

    #[arg(long, env = "SHUFFLE_SERVER_ID")]
    server_id: String,

    /// Writes to a local directory instead of the remote tier; for development only.
    #[arg(long)]
    local_dev_handler: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let disk_item = DiskItem::new(DiskItemConfig {
        base_path: cli.base_path,
        capacity: cli.capacity,
        high_water_mark: cli.high_water_mark,
        low_water_mark: cli.low_water_mark,
        shuffle_expired_timeout_ms: cli.shuffle_expired_timeout_ms,
    });
    disk_item.start();

    let handler: Arc<dyn UploadHandler> = if let Some(dir) = cli.local_dev_handler {
        Arc::new(LocalUploadHandler::new(dir))
    } else {
        #[cfg(feature = "hdfs")]
        {
            Arc::new(shuffle_uploader::HdfsUploadHandler::new(&cli.hdfs_base_path)?)
        }
        #[cfg(not(feature = "hdfs"))]
        {
            anyhow::bail!(
                "no --local-dev-handler given and this binary was built without the `hdfs` feature"
            );
        }
    };

    let uploader = ShuffleUploaderBuilder::new()
        .disk_item(Arc::clone(&disk_item))
        .handler(handler)
        .upload_thread_num(cli.upload_thread_num)
        .upload_interval_ms(cli.upload_interval_ms)
        .upload_combine_threshold_mb(cli.upload_combine_threshold_mb)
        .reference_upload_speed_mbs(cli.reference_upload_speed_mbs)
        .remote_storage_type(RemoteStorageType::Hdfs)
        .hdfs_base_path(cli.hdfs_base_path)
        .server_id(cli.server_id)
        .hadoop_conf(HashMap::new())
        .max_shuffle_size(cli.max_shuffle_size)
        .max_force_upload_expire_time_s(cli.max_force_upload_expire_time_s)
        .build()
        .map_err(|e| {
            error!("failed to start shuffle uploader: {e}");
            e
        })?;

    uploader.start();
    info!("shuffle uploader started");

    let shutdown = Arc::new(AtomicBool::new(false));
    #[cfg(unix)]
    {
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    }

    while !shutdown.load(Ordering::SeqCst) {
        thread::park_timeout(Duration::from_secs(1));
    }

    info!("shutting down shuffle uploader");
    uploader.stop();
    disk_item.stop();
    Ok(())
}
