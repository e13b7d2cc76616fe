use std::fs;

use log::debug;

use crate::disk_item::DiskItem;
use crate::types::{remote_prefix, PartitionId, ShuffleFileInfo, ShuffleKey};

/// Picks which resident shuffle files should be uploaded this tick.
///
/// See the per-disk selection policy this mirrors: coldest-key-first under `forced`
/// pressure, largest-key-first otherwise, partitions packed ascending into batches
/// capped at `max_shuffle_size` bytes, with a per-key batch cap under `forced`.
pub fn select_shuffle_files(
    disk_item: &DiskItem,
    server_id: &str,
    hdfs_base_path: &str,
    max_shuffle_size: u64,
    max_thread_num: usize,
    forced: bool,
) -> Vec<ShuffleFileInfo> {
    let candidates = disk_item.sorted_shuffle_keys(forced, max_thread_num);
    let mut out = Vec::new();

    for key in candidates {
        let size = disk_item.not_uploaded_size(&key);
        let bitmap = disk_item.not_uploaded_partitions(&key);
        if size == 0 || bitmap.is_empty() {
            continue;
        }

        let mut batches = batches_for_key(
            disk_item,
            &key,
            server_id,
            hdfs_base_path,
            max_shuffle_size,
            &bitmap,
        );

        if forced && batches.len() > max_thread_num {
            let dropped = batches.len() - max_thread_num;
            debug!(
                target: "uploader::select",
                "forced mode: dropping {dropped} batch(es) for {key} beyond the {max_thread_num} thread cap"
            );
            batches.truncate(max_thread_num);
        }

        out.extend(batches);
    }

    out
}

fn batches_for_key(
    disk_item: &DiskItem,
    key: &ShuffleKey,
    server_id: &str,
    hdfs_base_path: &str,
    max_shuffle_size: u64,
    bitmap: &croaring::Bitmap,
) -> Vec<ShuffleFileInfo> {
    let remote_prefix = remote_prefix(hdfs_base_path, server_id, key);
    let mut partition_ids: Vec<PartitionId> = bitmap.iter().collect();
    partition_ids.sort_unstable();

    let mut batches: Vec<ShuffleFileInfo> = Vec::new();
    let mut current = new_batch(key, server_id, &remote_prefix);

    for partition_id in partition_ids {
        let dir = disk_item
            .base_path()
            .join(&key.app_id)
            .join(&key.shuffle_id)
            .join(format!("{partition_id}-{partition_id}"));
        let data_path = dir.join(format!("{server_id}.data"));
        let index_path = dir.join(format!("{server_id}.index"));

        let data_len = match file_len_nonzero(&data_path) {
            Some(len) => len,
            None => continue,
        };
        if file_len_nonzero(&index_path).is_none() {
            debug!(
                target: "uploader::select",
                "partition {partition_id} of {key} missing or empty index file, skipping this tick"
            );
            continue;
        }

        if data_len > max_shuffle_size {
            if !current.is_empty() {
                batches.push(std::mem::replace(
                    &mut current,
                    new_batch(key, server_id, &remote_prefix),
                ));
            }
            let mut solo = new_batch(key, server_id, &remote_prefix);
            push_partition(&mut solo, partition_id, data_path, index_path, data_len);
            batches.push(solo);
            continue;
        }

        if current.total_bytes + data_len > max_shuffle_size && !current.is_empty() {
            batches.push(std::mem::replace(
                &mut current,
                new_batch(key, server_id, &remote_prefix),
            ));
        }
        push_partition(&mut current, partition_id, data_path, index_path, data_len);
    }

    if !current.is_empty() {
        batches.push(current);
    }

    batches
}

fn new_batch(key: &ShuffleKey, server_id: &str, remote_prefix: &str) -> ShuffleFileInfo {
    ShuffleFileInfo {
        key: key.clone(),
        server_id: server_id.to_string(),
        data_files: Vec::new(),
        index_files: Vec::new(),
        partition_ids: Vec::new(),
        total_bytes: 0,
        remote_prefix: remote_prefix.to_string(),
    }
}

fn push_partition(
    batch: &mut ShuffleFileInfo,
    partition_id: PartitionId,
    data_path: std::path::PathBuf,
    index_path: std::path::PathBuf,
    data_len: u64,
) {
    batch.data_files.push(data_path);
    batch.index_files.push(index_path);
    batch.partition_ids.push(partition_id);
    batch.total_bytes += data_len;
}

fn file_len_nonzero(path: &std::path::Path) -> Option<u64> {
    let meta = fs::metadata(path).ok()?;
    let len = meta.len();
    if len == 0 {
        None
    } else {
        Some(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk_item::{DiskItem, DiskItemConfig};
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::tempdir;

    fn make_partition(base: &std::path::Path, app: &str, shuffle: &str, p: u32, server: &str, len: usize) {
        let dir = base.join(app).join(shuffle).join(format!("{p}-{p}"));
        fs::create_dir_all(&dir).unwrap();
        File::create(dir.join(format!("{server}.data")))
            .unwrap()
            .write_all(&vec![0u8; len])
            .unwrap();
        File::create(dir.join(format!("{server}.index")))
            .unwrap()
            .write_all(b"idx")
            .unwrap();
    }

    fn disk_item(tmp: &std::path::Path) -> std::sync::Arc<DiskItem> {
        DiskItem::new(DiskItemConfig {
            base_path: tmp.to_path_buf(),
            capacity: 1_000_000,
            high_water_mark: 0.8,
            low_water_mark: 0.6,
            shuffle_expired_timeout_ms: 60_000,
        })
    }

    #[test]
    fn unbounded_max_size_combines_all_complete_pairs() {
        let tmp = tempdir().unwrap();
        let item = disk_item(tmp.path());
        let key = ShuffleKey::new("app-1", "1");
        for p in 1..=3u32 {
            make_partition(tmp.path(), "app-1", "1", p, "server-a", 10);
        }
        // partition 4 has a data file but no index file.
        let dir4 = tmp.path().join("app-1").join("1").join("4-4");
        fs::create_dir_all(&dir4).unwrap();
        File::create(dir4.join("server-a.data")).unwrap().write_all(b"0123456789").unwrap();

        item.update_write(&key, 40, &[1, 2, 3, 4]);

        let batches = select_shuffle_files(&item, "server-a", "hdfs://base", u64::MAX, 4, false);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].partition_ids, vec![1, 2, 3]);
        assert_eq!(batches[0].total_bytes, 30);
    }

    #[test]
    fn small_max_size_splits_one_partition_per_batch() {
        let tmp = tempdir().unwrap();
        let item = disk_item(tmp.path());
        let key = ShuffleKey::new("app-1", "1");
        for p in 1..=3u32 {
            make_partition(tmp.path(), "app-1", "1", p, "server-a", 10);
        }
        item.update_write(&key, 30, &[1, 2, 3]);

        let batches = select_shuffle_files(&item, "server-a", "hdfs://base", 5, 4, false);
        assert_eq!(batches.len(), 3);
        for b in &batches {
            assert_eq!(b.partition_ids.len(), 1);
            assert_eq!(b.total_bytes, 10);
        }
    }

    #[test]
    fn mid_max_size_combines_partitions_until_limit() {
        let tmp = tempdir().unwrap();
        let item = disk_item(tmp.path());
        let key = ShuffleKey::new("app-1", "1");
        for p in 1..=3u32 {
            make_partition(tmp.path(), "app-1", "1", p, "server-a", 10);
        }
        item.update_write(&key, 30, &[1, 2, 3]);

        let batches = select_shuffle_files(&item, "server-a", "hdfs://base", 25, 4, false);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].partition_ids, vec![1, 2]);
        assert_eq!(batches[0].total_bytes, 20);
        assert_eq!(batches[1].partition_ids, vec![3]);
        assert_eq!(batches[1].total_bytes, 10);
    }

    #[test]
    fn forced_mode_caps_batches_per_key_at_thread_num() {
        let tmp = tempdir().unwrap();
        let item = disk_item(tmp.path());

        for app_idx in 1..=4 {
            let app = format!("app-{app_idx}");
            let key = ShuffleKey::new(app.clone(), "1");
            let mut partitions = Vec::new();
            for p in 1..=5u32 {
                make_partition(tmp.path(), &app, "1", p, "server-a", 5);
                partitions.push(p);
            }
            item.update_write(&key, 25, &partitions);
        }

        let unforced = select_shuffle_files(&item, "server-a", "hdfs://base", 5, 4, false);
        assert_eq!(unforced.len(), 20);

        let forced = select_shuffle_files(&item, "server-a", "hdfs://base", 5, 4, true);
        assert_eq!(forced.len(), 16);
    }
}
