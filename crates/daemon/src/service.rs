//! Operations offered to outside callers: manual submission, reprocessing,
//! listings and statistics.

use crate::destination::{compute_destination, ensure_parent_dir};
use crate::job::JobRequest;
use crate::queue::JobQueue;
use crate::stats::{RecordView, StatisticsReport};
use crate::store::{JobRecord, JobStateStore, JobStatus, RecordUpdate, StatusCounts, StoreError};
use crate::worker::{WorkerBoard, WorkerSnapshot};
use recodex_config::{find_profile, Profile, ProfileTable, WatchTarget};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Error type for service operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No profile has this key or display name.
    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    /// The file to transcode does not exist.
    #[error("source file does not exist: {}", .0.display())]
    SourceMissing(PathBuf),

    /// The destination directory could not be created.
    #[error("cannot create output directory for {}: {source}", .path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The job store rejected the operation.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A request accepted into the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmittedJob {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub profile_key: String,
    pub profile_name: String,
    /// Record the job will run under, when one already exists.
    pub record_id: Option<u64>,
}

impl From<&JobRequest> for SubmittedJob {
    fn from(request: &JobRequest) -> Self {
        Self {
            source: request.source.clone(),
            destination: request.destination.clone(),
            profile_key: request.profile_key.clone(),
            profile_name: request.profile.name.clone(),
            record_id: request.record_id,
        }
    }
}

/// Worker snapshots plus the number of jobs waiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkersReport {
    pub workers: Vec<WorkerSnapshot>,
    pub queue_depth: usize,
}

/// Profiles and watch targets the daemon runs with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigReport {
    pub profiles: ProfileTable,
    pub watch: Vec<WatchTarget>,
}

/// Overall daemon status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub uptime_secs: u64,
    pub dry_run: bool,
    /// Directories with a running watcher.
    pub watching: Vec<PathBuf>,
    /// Configured watch targets, running or not.
    pub watch_targets: usize,
    pub workers: Vec<WorkerSnapshot>,
    pub queue_depth: usize,
    pub jobs: StatusCounts,
}

/// Shared handle over the store, queue and profile table.
pub struct JobService {
    store: Arc<JobStateStore>,
    queue: JobQueue,
    profiles: Arc<ProfileTable>,
    workers: WorkerBoard,
    watch_targets: Vec<WatchTarget>,
    dry_run: bool,
    watching: RwLock<Vec<PathBuf>>,
    started: Instant,
}

impl JobService {
    pub fn new(
        store: Arc<JobStateStore>,
        queue: JobQueue,
        profiles: Arc<ProfileTable>,
        workers: WorkerBoard,
    ) -> Self {
        Self {
            store,
            queue,
            profiles,
            workers,
            watch_targets: Vec::new(),
            dry_run: false,
            watching: RwLock::new(Vec::new()),
            started: Instant::now(),
        }
    }

    pub fn with_watch_targets(mut self, targets: Vec<WatchTarget>) -> Self {
        self.watch_targets = targets;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Record which watch directories currently have a running watcher.
    pub async fn set_watching(&self, paths: Vec<PathBuf>) {
        *self.watching.write().await = paths;
    }

    pub fn store(&self) -> &Arc<JobStateStore> {
        &self.store
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn profiles(&self) -> &Arc<ProfileTable> {
        &self.profiles
    }

    fn resolve(&self, reference: &str) -> Result<(String, Profile), ServiceError> {
        find_profile(&self.profiles, reference)
            .map(|(key, profile)| (key.to_string(), profile.clone()))
            .ok_or_else(|| ServiceError::UnknownProfile(reference.to_string()))
    }

    /// Profile for an existing record: its key first, then its display name.
    fn resolve_record(&self, record: &JobRecord) -> Result<(String, Profile), ServiceError> {
        self.resolve(&record.profile_key)
            .or_else(|_| self.resolve(&record.profile_name))
    }

    /// Queue `source` for transcoding outside of any watch target.
    ///
    /// The destination defaults to the usual naming next to the source.
    pub fn submit(
        &self,
        source: PathBuf,
        profile_ref: &str,
        destination: Option<PathBuf>,
    ) -> Result<SubmittedJob, ServiceError> {
        let (profile_key, profile) = self.resolve(profile_ref)?;
        if !source.is_file() {
            return Err(ServiceError::SourceMissing(source));
        }

        let destination =
            destination.unwrap_or_else(|| compute_destination(&source, &profile, None));
        ensure_parent_dir(&destination).map_err(|e| ServiceError::OutputDir {
            path: destination.clone(),
            source: e,
        })?;

        let request = JobRequest::new(source, destination, profile_key, profile);
        let submitted = SubmittedJob::from(&request);
        info!(
            source = %submitted.source.display(),
            destination = %submitted.destination.display(),
            profile = %submitted.profile_key,
            "manual job submitted"
        );
        self.queue.enqueue(request);
        Ok(submitted)
    }

    /// Create a fresh `pending` copy of a finished record and queue it.
    ///
    /// Fails without any mutation if the record is missing, still active, or
    /// its profile is no longer configured.
    pub async fn reprocess(&self, id: u64) -> Result<JobRecord, ServiceError> {
        let original = self.store.get(id).await.ok_or(StoreError::NotFound(id))?;
        if !original.status.is_terminal() {
            return Err(StoreError::NotReprocessable {
                id,
                status: original.status,
            }
            .into());
        }
        let (profile_key, profile) = self.resolve_record(&original)?;

        let record = self.store.reprocess(id).await?;
        let request = JobRequest::new(
            record.source.clone(),
            record.destination.clone(),
            profile_key,
            profile,
        )
        .with_record(record.id);
        self.queue.enqueue(request);
        Ok(record)
    }

    /// Queue every `pending` record left over from a previous run.
    ///
    /// Records whose profile is gone are marked failed instead. Returns the
    /// number of jobs queued.
    pub async fn requeue_pending(&self) -> Result<usize, ServiceError> {
        let mut queued = 0;
        for record in self.store.recoverable_pending().await {
            match self.resolve_record(&record) {
                Ok((profile_key, profile)) => {
                    let request = JobRequest::new(
                        record.source.clone(),
                        record.destination.clone(),
                        profile_key,
                        profile,
                    )
                    .with_record(record.id);
                    self.queue.enqueue(request);
                    queued += 1;
                }
                Err(e) => {
                    warn!(record_id = record.id, error = %e, "cannot resume pending job");
                    self.store
                        .update_record(record.id, RecordUpdate::failed(e.to_string(), None))
                        .await?;
                }
            }
        }
        if queued > 0 {
            info!(queued, "resumed pending jobs from previous run");
        }
        Ok(queued)
    }

    pub async fn get(&self, id: u64) -> Option<RecordView> {
        self.store.get(id).await.map(RecordView::from)
    }

    /// Records with `status`, or every record when `None`.
    pub async fn list(&self, status: Option<JobStatus>) -> Vec<RecordView> {
        let records = match status {
            Some(status) => self.store.list_by_status(status).await,
            None => self.store.list_all().await,
        };
        records.into_iter().map(RecordView::from).collect()
    }

    pub async fn statistics(&self) -> StatisticsReport {
        let records = self.store.list_all().await;
        StatisticsReport::from_records(&records, self.queue.len())
    }

    pub async fn workers(&self) -> WorkersReport {
        WorkersReport {
            workers: self.workers.snapshot().await,
            queue_depth: self.queue.len(),
        }
    }

    pub fn config(&self) -> ConfigReport {
        ConfigReport {
            profiles: self.profiles.as_ref().clone(),
            watch: self.watch_targets.clone(),
        }
    }

    pub async fn status(&self) -> StatusReport {
        StatusReport {
            uptime_secs: self.started.elapsed().as_secs(),
            dry_run: self.dry_run,
            watching: self.watching.read().await.clone(),
            watch_targets: self.watch_targets.len(),
            workers: self.workers.snapshot().await,
            queue_depth: self.queue.len(),
            jobs: self.store.counts().await,
        }
    }
}
