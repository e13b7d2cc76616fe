use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};

use crate::disk_item::DiskItem;
use crate::metrics::{NoopMetrics, UploadMetrics};
use crate::selection::select_shuffle_files;
use crate::types::{ShuffleFileInfo, ShuffleUploadResult};
use crate::upload_handler::UploadHandler;

/// Parameters that drive `calculateUploadTime`; kept separate from `UploaderConfig` so
/// the formula can be unit tested without constructing a whole uploader.
#[derive(Debug, Clone, Copy)]
pub struct DeadlineParams {
    pub reference_upload_speed_mbs: f64,
    pub upload_thread_num: usize,
    pub max_force_upload_expire_time_s: u64,
}

/// Computes how long a tick should wait for its dispatched batches before giving up on
/// the slowest stragglers. Matches the formula this module was designed against: a
/// throughput estimate clamped to a sane minimum, with an extra ceiling under forced mode.
///
/// Newly submitted bytes count double against already in-flight bytes: a batch this
/// tick still has to be read off local disk as well as written remotely, while an
/// in-flight batch has already paid the read cost.
pub fn calculate_upload_time(
    params: &DeadlineParams,
    in_flight_bytes: u64,
    new_bytes: u64,
    forced: bool,
) -> u64 {
    let weighted_mb = (in_flight_bytes + 2 * new_bytes) as f64 / (1024.0 * 1024.0);
    let denom = params.reference_upload_speed_mbs * params.upload_thread_num as f64;
    let raw = if denom > 0.0 { (weighted_mb / denom).ceil() as u64 } else { 0 };

    if forced {
        raw.clamp(1, params.max_force_upload_expire_time_s)
    } else {
        raw.max(2)
    }
}

struct WorkerTask {
    batch: ShuffleFileInfo,
    reply: Sender<(ShuffleFileInfo, Option<ShuffleUploadResult>)>,
}

/// Fixed-size pool of OS threads that run `UploadHandler::upload` for dispatched batches.
struct WorkerPool {
    senders: Vec<Sender<WorkerTask>>,
    next: AtomicUsize,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn new(size: usize, handler: Arc<dyn UploadHandler>) -> Self {
        assert!(size > 0, "worker pool size must be positive");
        let mut senders = Vec::with_capacity(size);
        let mut workers = Vec::with_capacity(size);

        for i in 0..size {
            let (tx, rx): (Sender<WorkerTask>, Receiver<WorkerTask>) = unbounded();
            let handler = Arc::clone(&handler);
            let handle = thread::Builder::new()
                .name(format!("shuffle-upload-worker-{i}"))
                .spawn(move || worker_loop(rx, handler))
                .expect("failed to spawn upload worker thread");
            senders.push(tx);
            workers.push(handle);
        }

        WorkerPool {
            senders,
            next: AtomicUsize::new(0),
            workers,
        }
    }

    fn submit(&self, task: WorkerTask) {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        let _ = self.senders[idx].send(task);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.senders.clear();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(rx: Receiver<WorkerTask>, handler: Arc<dyn UploadHandler>) {
    while let Ok(task) = rx.recv() {
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler.upload(&task.batch)));
        let outcome = match result {
            Ok(r) => Some(r),
            Err(_) => {
                warn!(target: "uploader::dispatch", "upload worker panicked on {}", task.batch.key);
                None
            }
        };
        let _ = task.reply.send((task.batch, outcome));
    }
}

pub struct UploaderConfig {
    pub server_id: String,
    pub hdfs_base_path: String,
    pub upload_thread_num: usize,
    pub upload_interval_ms: u64,
    pub max_shuffle_size: u64,
    pub deadline: DeadlineParams,
}

/// Drives the periodic selection → dispatch → reconcile cycle for one disk.
pub struct ShuffleUploader {
    config: UploaderConfig,
    disk_item: Arc<DiskItem>,
    pool: WorkerPool,
    in_flight_bytes: Mutex<u64>,
    running: Arc<AtomicBool>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<dyn UploadMetrics>,
}

impl ShuffleUploader {
    pub fn new(
        config: UploaderConfig,
        disk_item: Arc<DiskItem>,
        handler: Arc<dyn UploadHandler>,
    ) -> Arc<Self> {
        Self::with_metrics(config, disk_item, handler, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(
        config: UploaderConfig,
        disk_item: Arc<DiskItem>,
        handler: Arc<dyn UploadHandler>,
        metrics: Arc<dyn UploadMetrics>,
    ) -> Arc<Self> {
        let pool = WorkerPool::new(config.upload_thread_num, handler);
        Arc::new(ShuffleUploader {
            config,
            disk_item,
            pool,
            in_flight_bytes: Mutex::new(0),
            running: Arc::new(AtomicBool::new(false)),
            scheduler: Mutex::new(None),
            metrics,
        })
    }

    fn is_forced(&self) -> bool {
        let used = self.disk_item.used_bytes();
        let capacity = self.disk_item.get_capacity();
        used as f64 >= self.disk_item.get_high_water_mark_of_write() * capacity as f64
    }

    /// Runs exactly one selection+dispatch+reconcile cycle. Public so callers (and
    /// tests) can drive ticks deterministically instead of waiting on the scheduler.
    pub fn upload(&self) {
        let forced = self.is_forced();
        let batches = select_shuffle_files(
            &self.disk_item,
            &self.config.server_id,
            &self.config.hdfs_base_path,
            self.config.max_shuffle_size,
            self.config.upload_thread_num,
            forced,
        );

        if batches.is_empty() {
            return;
        }

        self.metrics.record_tick(forced, batches.len());

        let this_tick_bytes: u64 = batches.iter().map(|b| b.total_bytes).sum();
        let in_flight = *self.in_flight_bytes.lock().expect("in_flight mutex poisoned");
        let deadline_secs =
            calculate_upload_time(&self.config.deadline, in_flight, this_tick_bytes, forced);

        {
            let mut guard = self.in_flight_bytes.lock().expect("in_flight mutex poisoned");
            *guard += this_tick_bytes;
        }

        let (reply_tx, reply_rx) = bounded(batches.len());
        let dispatched = batches.len();
        for batch in batches {
            self.pool.submit(WorkerTask {
                batch,
                reply: reply_tx.clone(),
            });
        }
        drop(reply_tx);

        let deadline = Instant::now() + Duration::from_secs(deadline_secs);
        let mut observed = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match reply_rx.recv_timeout(remaining) {
                Ok((batch, outcome)) => {
                    observed += 1;
                    self.reconcile(batch, outcome);
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        {
            let mut guard = self.in_flight_bytes.lock().expect("in_flight mutex poisoned");
            *guard = guard.saturating_sub(this_tick_bytes);
        }

        if observed < dispatched {
            self.metrics.record_deadline_elapsed();
            debug!(
                target: "uploader::dispatch",
                "tick abandoned {} of {dispatched} batch(es) past the {deadline_secs}s deadline",
                dispatched - observed
            );
        }
    }

    fn reconcile(&self, batch: ShuffleFileInfo, outcome: Option<ShuffleUploadResult>) {
        let Some(result) = outcome else { return };
        if result.uploaded_partition_ids.is_empty() {
            debug!(target: "uploader::dispatch", "no partitions of {} confirmed uploaded this tick", batch.key);
            return;
        }

        self.disk_item.update_uploaded_state(
            &batch.key,
            &result.uploaded_partition_ids,
            result.uploaded_bytes,
        );
        self.metrics
            .record_batch_uploaded(result.uploaded_bytes, result.uploaded_partition_ids.len());

        if self.disk_item.is_reading_in_progress(&batch.key) {
            debug!(
                target: "uploader::dispatch",
                "deferring local deletion for {} — read lease still held",
                batch.key
            );
            return;
        }

        for (idx, partition_id) in batch.partition_ids.iter().enumerate() {
            if !result.uploaded_partition_ids.contains(partition_id) {
                continue;
            }
            delete_pair(&batch.data_files[idx], &batch.index_files[idx]);
        }
        info!(
            target: "uploader::dispatch",
            "uploaded {} bytes across {} partition(s) of {}",
            result.uploaded_bytes,
            result.uploaded_partition_ids.len(),
            batch.key
        );
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let running = Arc::clone(&self.running);
        let interval = Duration::from_millis(self.config.upload_interval_ms);
        let handle = thread::Builder::new()
            .name("shuffle-uploader-scheduler".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    this.upload();
                    thread::sleep(interval);
                }
            })
            .expect("failed to spawn uploader scheduler thread");
        *self.scheduler.lock().expect("scheduler handle poisoned") = Some(handle);
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.scheduler.lock().expect("scheduler handle poisoned").take() {
            let _ = handle.join();
        }
    }
}

fn delete_pair(data_path: &std::path::Path, index_path: &std::path::Path) {
    if let Err(err) = std::fs::remove_file(data_path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(target: "uploader::dispatch", "failed to delete {}: {err}", data_path.display());
        }
    }
    if let Err(err) = std::fs::remove_file(index_path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(target: "uploader::dispatch", "failed to delete {}: {err}", index_path.display());
        }
    }
    if let Some(dir) = data_path.parent() {
        if let Ok(mut entries) = std::fs::read_dir(dir) {
            if entries.next().is_none() {
                let _ = std::fs::remove_dir(dir);
            }
        }
    }
}
