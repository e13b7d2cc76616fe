use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use shuffle_uploader::{
    DiskItem, DiskItemConfig, LocalUploadHandler, RemoteStorageType, ShuffleKey,
    ShuffleUploaderBuilder,
};
use tempfile::tempdir;

fn write_partition(base: &std::path::Path, key: &ShuffleKey, partition: u32, server: &str, len: usize) {
    let dir = base
        .join(&key.app_id)
        .join(&key.shuffle_id)
        .join(format!("{partition}-{partition}"));
    fs::create_dir_all(&dir).unwrap();
    File::create(dir.join(format!("{server}.data")))
        .unwrap()
        .write_all(&vec![7u8; len])
        .unwrap();
    File::create(dir.join(format!("{server}.index")))
        .unwrap()
        .write_all(b"index")
        .unwrap();
}

fn disk_item(base: &std::path::Path) -> Arc<DiskItem> {
    DiskItem::new(DiskItemConfig {
        base_path: base.to_path_buf(),
        capacity: 10_000,
        high_water_mark: 0.9,
        low_water_mark: 0.5,
        shuffle_expired_timeout_ms: 100,
    })
}

#[test]
fn upload_reconciles_state_and_deletes_uploaded_partitions() {
    let tmp = tempdir().unwrap();
    let remote = tempdir().unwrap();
    let key = ShuffleKey::new("app-1", "1");

    write_partition(tmp.path(), &key, 1, "server-a", 20);
    write_partition(tmp.path(), &key, 2, "server-a", 30);
    write_partition(tmp.path(), &key, 3, "server-a", 20);

    let item = disk_item(tmp.path());
    item.update_write(&key, 70, &[1, 2, 3]);

    let uploader = ShuffleUploaderBuilder::new()
        .disk_item(Arc::clone(&item))
        .handler(Arc::new(LocalUploadHandler::new(remote.path())))
        .upload_thread_num(2)
        .upload_interval_ms(10_000)
        .upload_combine_threshold_mb(300)
        .reference_upload_speed_mbs(1000.0)
        .remote_storage_type(RemoteStorageType::Hdfs)
        .hdfs_base_path("hdfs://base")
        .server_id("server-a")
        .hadoop_conf(HashMap::new())
        .max_shuffle_size(1_000_000)
        .max_force_upload_expire_time_s(30)
        .build()
        .unwrap();

    uploader.upload();

    assert_eq!(item.not_uploaded_size(&key), 0);
    assert!(item.not_uploaded_partitions(&key).is_empty());

    let dir1 = tmp.path().join("app-1").join("1").join("1-1");
    let dir2 = tmp.path().join("app-1").join("1").join("2-2");
    let dir3 = tmp.path().join("app-1").join("1").join("3-3");
    assert!(!dir1.join("server-a.data").exists());
    assert!(!dir2.join("server-a.data").exists());
    assert!(!dir3.join("server-a.data").exists());
}

#[test]
fn reading_in_progress_inhibits_deletion_until_expiry() {
    let tmp = tempdir().unwrap();
    let remote = tempdir().unwrap();
    let key = ShuffleKey::new("app-1", "1");

    write_partition(tmp.path(), &key, 1, "server-a", 20);
    let item = disk_item(tmp.path());
    item.update_write(&key, 20, &[1]);
    item.prepare_start_read(&key);
    item.start();

    let uploader = ShuffleUploaderBuilder::new()
        .disk_item(Arc::clone(&item))
        .handler(Arc::new(LocalUploadHandler::new(remote.path())))
        .upload_thread_num(1)
        .upload_interval_ms(10_000)
        .upload_combine_threshold_mb(300)
        .reference_upload_speed_mbs(1000.0)
        .remote_storage_type(RemoteStorageType::Hdfs)
        .hdfs_base_path("hdfs://base")
        .server_id("server-a")
        .hadoop_conf(HashMap::new())
        .max_shuffle_size(1_000_000)
        .max_force_upload_expire_time_s(30)
        .build()
        .unwrap();

    uploader.upload();

    let data_path = tmp
        .path()
        .join("app-1")
        .join("1")
        .join("1-1")
        .join("server-a.data");
    assert!(
        data_path.exists(),
        "file must survive while the read lease is held"
    );

    std::thread::sleep(Duration::from_millis(400));
    assert!(
        !data_path.exists(),
        "file must be removed once the sweeper observes the expired read lease"
    );

    item.stop();
}
