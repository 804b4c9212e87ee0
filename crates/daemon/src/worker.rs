//! Worker pool executing queued jobs.
//!
//! Each worker repeatedly takes a request from the shared queue, records it in
//! the job store, runs the transcode engine and records the outcome. Engine
//! failures and panics become `failed` records; they never stop a worker.
//! Only an unusable store stops a worker, and that is reported on the fatal
//! channel so the daemon can shut down.

use crate::engine::{ProgressSink, TranscodeEngine};
use crate::job::{JobOutcome, JobRequest};
use crate::queue::JobQueue;
use crate::store::{JobStateStore, NewRecord, RecordUpdate, StoreError};
use recodex_config::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    /// Longest a worker waits on an empty queue before rechecking shutdown.
    pub poll_interval: Duration,
    /// Pause after an unexpected non-fatal fault.
    pub error_backoff: Duration,
}

impl From<&WorkerConfig> for PoolSettings {
    fn from(cfg: &WorkerConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            error_backoff: Duration::from_secs(cfg.error_backoff_secs),
        }
    }
}

/// What a worker is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Processing,
}

/// Point-in-time status of one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub worker_id: usize,
    pub state: WorkerState,
    pub record_id: Option<u64>,
    pub source: Option<PathBuf>,
    /// Percent complete of the current job, 0 when idle.
    pub progress: f32,
}

#[derive(Default)]
struct Slot {
    current: Option<(u64, PathBuf, watch::Receiver<f32>)>,
}

/// Live status of every worker in a pool, readable from anywhere.
///
/// Created before the pool so observers can hold it independently of the
/// pool's lifetime.
#[derive(Clone)]
pub struct WorkerBoard {
    slots: Arc<Vec<RwLock<Slot>>>,
}

impl WorkerBoard {
    pub fn new(workers: usize) -> Self {
        Self {
            slots: Arc::new((0..workers).map(|_| RwLock::new(Slot::default())).collect()),
        }
    }

    /// Number of worker slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let mut snapshots = Vec::with_capacity(self.slots.len());
        for (worker_id, slot) in self.slots.iter().enumerate() {
            let slot = slot.read().await;
            snapshots.push(match &slot.current {
                Some((record_id, source, progress)) => WorkerSnapshot {
                    worker_id,
                    state: WorkerState::Processing,
                    record_id: Some(*record_id),
                    source: Some(source.clone()),
                    progress: *progress.borrow(),
                },
                None => WorkerSnapshot {
                    worker_id,
                    state: WorkerState::Idle,
                    record_id: None,
                    source: None,
                    progress: 0.0,
                },
            });
        }
        snapshots
    }

    async fn set_busy(
        &self,
        worker_id: usize,
        record_id: u64,
        source: PathBuf,
        progress: watch::Receiver<f32>,
    ) {
        if let Some(slot) = self.slots.get(worker_id) {
            slot.write().await.current = Some((record_id, source, progress));
        }
    }

    async fn set_idle(&self, worker_id: usize) {
        if let Some(slot) = self.slots.get(worker_id) {
            slot.write().await.current = None;
        }
    }
}

/// Everything a worker needs, shared across the pool.
struct WorkerContext {
    queue: JobQueue,
    store: Arc<JobStateStore>,
    engine: Arc<dyn TranscodeEngine>,
    fatal: mpsc::UnboundedSender<StoreError>,
    settings: PoolSettings,
}

/// A fixed set of workers draining one queue.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    board: WorkerBoard,
}

impl WorkerPool {
    /// Start one worker per slot of `board`.
    ///
    /// A worker that hits a fatal store error sends it on `fatal` and exits.
    pub fn start(
        settings: PoolSettings,
        board: WorkerBoard,
        queue: JobQueue,
        store: Arc<JobStateStore>,
        engine: Arc<dyn TranscodeEngine>,
        fatal: mpsc::UnboundedSender<StoreError>,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let workers = board.len();
        let context = Arc::new(WorkerContext {
            queue,
            store,
            engine,
            fatal,
            settings,
        });

        let handles = (0..workers)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    context.clone(),
                    board.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        info!(workers, "worker pool started");
        Self {
            shutdown,
            handles,
            board,
        }
    }

    pub fn size(&self) -> usize {
        self.board.len()
    }

    pub async fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.board.snapshot().await
    }

    /// Signal shutdown and wait for every worker to finish its current job.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task failed");
            }
        }
        info!("worker pool stopped");
    }
}

async fn run_worker(
    worker_id: usize,
    ctx: Arc<WorkerContext>,
    board: WorkerBoard,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(worker_id, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let request = tokio::select! {
            request = ctx.queue.dequeue(ctx.settings.poll_interval) => request,
            _ = shutdown.changed() => break,
        };
        let Some(request) = request else {
            continue;
        };

        match execute(worker_id, &ctx, &board, &request).await {
            Ok(outcome) => request.report(outcome),
            Err(e) => {
                request.report(JobOutcome::Failed);
                if e.is_fatal() {
                    error!(worker_id, error = %e, "job store unusable, worker exiting");
                    let _ = ctx.fatal.send(e);
                    break;
                }
                warn!(
                    worker_id,
                    source = %request.source.display(),
                    error = %e,
                    "job could not be recorded"
                );
                tokio::time::sleep(ctx.settings.error_backoff).await;
            }
        }
    }

    info!(worker_id, "worker stopped");
}

/// Run one job through its record lifecycle.
///
/// Returns `Err` only when the store rejects a write; the engine's own
/// failures are recorded and reported as [`JobOutcome::Failed`].
async fn execute(
    worker_id: usize,
    ctx: &WorkerContext,
    board: &WorkerBoard,
    request: &JobRequest,
) -> Result<JobOutcome, StoreError> {
    let record_id = match request.record_id {
        Some(id) => id,
        None => {
            ctx.store
                .add_record(NewRecord {
                    source: request.source.clone(),
                    destination: request.destination.clone(),
                    profile_key: request.profile_key.clone(),
                    profile_name: request.profile.name.clone(),
                    video_codec: Some(request.profile.video_codec.clone()),
                })
                .await?
                .id
        }
    };

    ctx.store
        .update_record(record_id, RecordUpdate::running())
        .await?;

    info!(
        worker_id,
        record_id,
        source = %request.source.display(),
        profile = %request.profile_key,
        "job started"
    );

    let (progress, progress_rx) = ProgressSink::new();
    board
        .set_busy(worker_id, record_id, request.source.clone(), progress_rx)
        .await;

    let started = Instant::now();
    let engine = ctx.engine.clone();
    let job = request.clone();
    let result = tokio::spawn(async move {
        engine
            .transcode(&job.source, &job.destination, &job.profile, &progress)
            .await
    })
    .await;
    let elapsed = started.elapsed().as_secs_f64();

    board.set_idle(worker_id).await;

    let (update, outcome) = match result {
        Ok(Ok(done)) => {
            info!(
                worker_id,
                record_id,
                original_size = done.original_size,
                final_size = ?done.final_size,
                secs = elapsed,
                "job completed"
            );
            (
                RecordUpdate::completed(
                    done.original_size,
                    done.final_size,
                    elapsed,
                    done.hardware_accel_used,
                ),
                JobOutcome::Completed,
            )
        }
        Ok(Err(e)) => {
            warn!(worker_id, record_id, error = %e, "job failed");
            (
                RecordUpdate::failed(e.to_string(), Some(elapsed)),
                JobOutcome::Failed,
            )
        }
        Err(e) => {
            error!(worker_id, record_id, error = %e, "engine panicked");
            (
                RecordUpdate::failed(format!("engine panicked: {}", e), Some(elapsed)),
                JobOutcome::Failed,
            )
        }
    };

    ctx.store.update_record(record_id, update).await?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, TranscodeOutcome};
    use crate::store::JobStatus;
    use async_trait::async_trait;
    use recodex_config::Profile;
    use std::path::Path;
    use tempfile::TempDir;

    struct Scripted {
        delay: Duration,
        fail: bool,
        panic: bool,
    }

    #[async_trait]
    impl TranscodeEngine for Scripted {
        async fn transcode(
            &self,
            _source: &Path,
            _destination: &Path,
            _profile: &Profile,
            progress: &ProgressSink,
        ) -> Result<TranscodeOutcome, EngineError> {
            progress.report(50.0);
            tokio::time::sleep(self.delay).await;
            if self.panic {
                panic!("scripted engine panic");
            }
            if self.fail {
                return Err(EngineError::FfmpegFailed {
                    code: 1,
                    detail: "scripted failure".to_string(),
                });
            }
            Ok(TranscodeOutcome {
                original_size: 1000,
                final_size: Some(400),
                hardware_accel_used: true,
            })
        }
    }

    fn settings() -> PoolSettings {
        PoolSettings {
            poll_interval: Duration::from_millis(20),
            error_backoff: Duration::from_millis(10),
        }
    }

    fn request(name: &str) -> JobRequest {
        JobRequest::new(
            PathBuf::from(format!("/in/{}.mp4", name)),
            PathBuf::from(format!("/in/{}_Balanced.mp4", name)),
            "balanced",
            Profile::named("Balanced"),
        )
    }

    async fn wait_for_status(store: &JobStateStore, id: u64, status: JobStatus) -> crate::store::JobRecord {
        for _ in 0..300 {
            if let Some(record) = store.get(id).await {
                if record.status == status {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("record {} never reached {}", id, status);
    }

    async fn pool_with(
        engine: Scripted,
        workers: usize,
    ) -> (TempDir, Arc<JobStateStore>, JobQueue, WorkerPool, mpsc::UnboundedReceiver<StoreError>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JobStateStore::open(dir.path()).await.unwrap());
        let queue = JobQueue::new();
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::start(
            settings(),
            WorkerBoard::new(workers),
            queue.clone(),
            store.clone(),
            Arc::new(engine),
            fatal_tx,
        );
        (dir, store, queue, pool, fatal_rx)
    }

    #[tokio::test]
    async fn test_successful_job_is_completed() {
        let engine = Scripted {
            delay: Duration::from_millis(10),
            fail: false,
            panic: false,
        };
        let (_dir, store, queue, pool, _fatal) = pool_with(engine, 1).await;

        queue.enqueue(request("a"));
        let record = wait_for_status(&store, 1, JobStatus::Completed).await;

        assert_eq!(record.original_size, Some(1000));
        assert_eq!(record.final_size, Some(400));
        assert!(record.hardware_accel_used);
        assert!(record.started_at.is_some());
        assert!(record.completed_at.is_some());
        assert!(record.processing_secs.unwrap() > 0.0);
        assert_eq!(record.video_codec.as_deref(), Some("h264"));
        assert_eq!(record.profile_name, "Balanced");

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_engine_failure_is_recorded() {
        let engine = Scripted {
            delay: Duration::ZERO,
            fail: true,
            panic: false,
        };
        let (_dir, store, queue, pool, _fatal) = pool_with(engine, 1).await;

        queue.enqueue(request("a"));
        let record = wait_for_status(&store, 1, JobStatus::Failed).await;
        assert!(record.error.unwrap().contains("scripted failure"));
        assert!(record.completed_at.is_some());

        // The worker keeps going after a failure
        queue.enqueue(request("b"));
        wait_for_status(&store, 2, JobStatus::Failed).await;

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_engine_panic_is_recorded() {
        let engine = Scripted {
            delay: Duration::ZERO,
            fail: false,
            panic: true,
        };
        let (_dir, store, queue, pool, _fatal) = pool_with(engine, 1).await;

        queue.enqueue(request("a"));
        let record = wait_for_status(&store, 1, JobStatus::Failed).await;
        assert!(record.error.unwrap().contains("panicked"));

        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot[0].state, WorkerState::Idle);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_adopts_existing_pending_record() {
        let engine = Scripted {
            delay: Duration::ZERO,
            fail: false,
            panic: false,
        };
        let (_dir, store, queue, pool, _fatal) = pool_with(engine, 1).await;

        let pending = store
            .add_record(NewRecord {
                source: PathBuf::from("/in/a.mp4"),
                destination: PathBuf::from("/in/a_Balanced.mp4"),
                profile_key: "balanced".to_string(),
                profile_name: "Balanced".to_string(),
                video_codec: Some("h264".to_string()),
            })
            .await
            .unwrap();

        queue.enqueue(request("a").with_record(pending.id));
        wait_for_status(&store, pending.id, JobStatus::Completed).await;
        assert_eq!(store.list_all().await.len(), 1);

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_snapshot_shows_running_job() {
        let engine = Scripted {
            delay: Duration::from_millis(400),
            fail: false,
            panic: false,
        };
        let (_dir, store, queue, pool, _fatal) = pool_with(engine, 2).await;
        assert_eq!(pool.size(), 2);

        queue.enqueue(request("a"));
        wait_for_status(&store, 1, JobStatus::Running).await;

        let mut busy = None;
        for _ in 0..50 {
            busy = pool
                .snapshot()
                .await
                .into_iter()
                .find(|w| w.state == WorkerState::Processing && w.progress >= 50.0);
            if busy.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let busy = busy.expect("a worker should be processing");
        assert_eq!(busy.record_id, Some(1));
        assert_eq!(busy.source, Some(PathBuf::from("/in/a.mp4")));

        pool.stop().await;
        // Stop waits for the in-flight job
        assert_eq!(store.get(1).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_each_job_runs_once_across_workers() {
        let engine = Scripted {
            delay: Duration::from_millis(20),
            fail: false,
            panic: false,
        };
        let (_dir, store, queue, pool, _fatal) = pool_with(engine, 3).await;

        for name in ["a", "b", "c", "d", "e"] {
            queue.enqueue(request(name));
        }
        for id in 1..=5 {
            wait_for_status(&store, id, JobStatus::Completed).await;
        }
        pool.stop().await;

        assert_eq!(store.list_all().await.len(), 5);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_closed_store_is_not_fatal() {
        let engine = Scripted {
            delay: Duration::ZERO,
            fail: false,
            panic: false,
        };
        let (_dir, store, queue, pool, mut fatal) = pool_with(engine, 1).await;
        store.close().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let origin = crate::job::WatchOrigin::new(PathBuf::from("/in"), tx);
        queue.enqueue(request("a").with_origin(origin));

        let feedback = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(feedback.outcome, JobOutcome::Failed);
        assert!(fatal.try_recv().is_err());

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_stop_idle_pool() {
        let engine = Scripted {
            delay: Duration::ZERO,
            fail: false,
            panic: false,
        };
        let (_dir, _store, _queue, pool, _fatal) = pool_with(engine, 4).await;
        tokio::time::timeout(Duration::from_secs(1), pool.stop())
            .await
            .unwrap();
    }
}
