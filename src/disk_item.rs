use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use croaring::Bitmap;
use log::{debug, warn};

use crate::types::{PartitionId, ShuffleKey};

const SWEEP_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct DiskItemConfig {
    pub base_path: PathBuf,
    pub capacity: u64,
    pub high_water_mark: f64,
    pub low_water_mark: f64,
    pub shuffle_expired_timeout_ms: u64,
}

#[derive(Debug)]
struct PerKeyState {
    not_uploaded_size: u64,
    not_uploaded_partitions: Bitmap,
    last_read_ts: Instant,
    reading_in_progress: bool,
}

impl PerKeyState {
    fn new() -> Self {
        PerKeyState {
            not_uploaded_size: 0,
            not_uploaded_partitions: Bitmap::new(),
            last_read_ts: Instant::now(),
            reading_in_progress: false,
        }
    }

    fn is_drained(&self) -> bool {
        self.not_uploaded_size == 0 && self.not_uploaded_partitions.is_empty()
    }
}

/// Per-disk bookkeeping: which shuffle keys are resident, how many bytes and which
/// partitions of each are still local-only, and whether a key is currently being read.
pub struct DiskItem {
    config: DiskItemConfig,
    state: Mutex<HashMap<ShuffleKey, PerKeyState>>,
    running: Arc<AtomicBool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl DiskItem {
    pub fn new(config: DiskItemConfig) -> Arc<Self> {
        Arc::new(DiskItem {
            config,
            state: Mutex::new(HashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            sweeper: Mutex::new(None),
        })
    }

    pub fn base_path(&self) -> &PathBuf {
        &self.config.base_path
    }

    pub fn get_capacity(&self) -> u64 {
        self.config.capacity
    }

    pub fn get_high_water_mark_of_write(&self) -> f64 {
        self.config.high_water_mark
    }

    pub fn get_low_water_mark_of_write(&self) -> f64 {
        self.config.low_water_mark
    }

    /// Total bytes currently resident under `basePath`, walked fresh on every call.
    /// This is the admission signal the uploader's force-upload decision reads; it
    /// reflects physical disk usage rather than `notUploadedSize` bookkeeping, since a
    /// key awaiting an expired read lease still occupies disk after it is "uploaded".
    pub fn used_bytes(&self) -> u64 {
        dir_size(&self.config.base_path)
    }

    pub fn create_metadata_if_not_exist(&self, key: &ShuffleKey) {
        let mut state = self.state.lock().expect("disk item state poisoned");
        state.entry(key.clone()).or_insert_with(PerKeyState::new);
    }

    pub fn update_write(&self, key: &ShuffleKey, bytes: u64, partition_ids: &[PartitionId]) {
        let mut state = self.state.lock().expect("disk item state poisoned");
        let entry = state.entry(key.clone()).or_insert_with(PerKeyState::new);
        entry.not_uploaded_size += bytes;
        for &p in partition_ids {
            entry.not_uploaded_partitions.add(p);
        }
    }

    pub fn not_uploaded_size(&self, key: &ShuffleKey) -> u64 {
        let state = self.state.lock().expect("disk item state poisoned");
        state.get(key).map(|s| s.not_uploaded_size).unwrap_or(0)
    }

    pub fn not_uploaded_partitions(&self, key: &ShuffleKey) -> Bitmap {
        let state = self.state.lock().expect("disk item state poisoned");
        state
            .get(key)
            .map(|s| s.not_uploaded_partitions.clone())
            .unwrap_or_default()
    }

    pub fn prepare_start_read(&self, key: &ShuffleKey) {
        let mut state = self.state.lock().expect("disk item state poisoned");
        let entry = state.entry(key.clone()).or_insert_with(PerKeyState::new);
        entry.reading_in_progress = true;
        entry.last_read_ts = Instant::now();
    }

    pub fn update_shuffle_last_read_ts(&self, key: &ShuffleKey) {
        let mut state = self.state.lock().expect("disk item state poisoned");
        if let Some(entry) = state.get_mut(key) {
            entry.last_read_ts = Instant::now();
        }
    }

    pub fn is_reading_in_progress(&self, key: &ShuffleKey) -> bool {
        let state = self.state.lock().expect("disk item state poisoned");
        state.get(key).map(|s| s.reading_in_progress).unwrap_or(false)
    }

    /// Ordering used by the uploader's selection policy: coldest-first when
    /// `prioritize_oldest` (forced mode), largest-not-uploaded-first otherwise.
    /// Ties are broken lexicographically by key.
    pub fn sorted_shuffle_keys(&self, prioritize_oldest: bool, limit: usize) -> Vec<ShuffleKey> {
        let state = self.state.lock().expect("disk item state poisoned");
        let mut entries: Vec<(&ShuffleKey, &PerKeyState)> = state.iter().collect();
        if prioritize_oldest {
            entries.sort_by(|a, b| {
                a.1.last_read_ts
                    .cmp(&b.1.last_read_ts)
                    .then_with(|| a.0.cmp(b.0))
            });
        } else {
            entries.sort_by(|a, b| {
                b.1.not_uploaded_size
                    .cmp(&a.1.not_uploaded_size)
                    .then_with(|| a.0.cmp(b.0))
            });
        }
        entries
            .into_iter()
            .take(limit)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Atomically decrements `not_uploaded_size` (clamped at zero) and clears the given
    /// partition bits for `key`. Idempotent: clearing an already-clear bit is a no-op,
    /// which makes late/duplicate results from abandoned tasks harmless.
    pub fn update_uploaded_state(&self, key: &ShuffleKey, partition_ids: &[PartitionId], bytes: u64) {
        let mut state = self.state.lock().expect("disk item state poisoned");
        let Some(entry) = state.get_mut(key) else {
            warn!(target: "disk_item", "update_uploaded_state for unknown key {key}");
            return;
        };
        if bytes > entry.not_uploaded_size {
            warn!(
                target: "disk_item",
                "handler reported {bytes} uploaded bytes for {key} but only {} were outstanding; clamping",
                entry.not_uploaded_size
            );
        }
        entry.not_uploaded_size = entry.not_uploaded_size.saturating_sub(bytes);
        for &p in partition_ids {
            entry.not_uploaded_partitions.remove(p);
        }
        if entry.is_drained() && !entry.reading_in_progress {
            state.remove(key);
        }
    }

    /// Starts the background sweeper thread that expires `reading_in_progress` flags and
    /// removes bookkeeping for keys that are fully drained and no longer being read.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let running = Arc::clone(&self.running);
        let handle = thread::Builder::new()
            .name("disk-item-sweeper".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    this.sweep_once();
                    thread::sleep(SWEEP_INTERVAL);
                }
            })
            .expect("failed to spawn disk item sweeper thread");
        *self.sweeper.lock().expect("sweeper handle poisoned") = Some(handle);
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.sweeper.lock().expect("sweeper handle poisoned").take() {
            let _ = handle.join();
        }
    }

    fn sweep_once(&self) {
        let expiry = Duration::from_millis(self.config.shuffle_expired_timeout_ms);
        let mut state = self.state.lock().expect("disk item state poisoned");
        let mut drained = Vec::new();
        for (key, entry) in state.iter_mut() {
            if entry.reading_in_progress && entry.last_read_ts.elapsed() > expiry {
                entry.reading_in_progress = false;
                debug!(target: "disk_item", "read lease for {key} expired");
            }
            if entry.is_drained() && !entry.reading_in_progress {
                drained.push(key.clone());
            }
        }
        for key in drained {
            state.remove(&key);
            self.remove_key_dir(&key);
        }
    }

    /// Removes whatever is left on disk for a key that is fully uploaded and no
    /// longer being read. Safe to call even if the uploader already deleted every
    /// partition pair itself — this only catches what a read lease held back.
    fn remove_key_dir(&self, key: &ShuffleKey) {
        let dir = self
            .config
            .base_path
            .join(&key.app_id)
            .join(&key.shuffle_id);
        if dir.exists() {
            if let Err(err) = fs::remove_dir_all(&dir) {
                warn!(target: "disk_item", "failed to remove drained directory for {key}: {err}");
            } else {
                debug!(target: "disk_item", "removed drained directory for {key}");
            }
        }
    }
}

impl Drop for DiskItem {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dir_size(path: &std::path::Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            total += dir_size(&entry.path());
        } else {
            total += meta.len();
        }
    }
    total
}
