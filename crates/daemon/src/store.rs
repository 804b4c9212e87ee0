//! Job state store: the authoritative record of every job's lifecycle.
//!
//! Records are kept in memory behind a `RwLock` and persisted as one JSON
//! document per record in the state directory. Each write goes to a temporary
//! file that is renamed into place, so a crash never leaves a truncated record
//! behind. Readers always receive clones, never a record mid-update.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Error message recorded on jobs that were running when the service stopped.
pub const INTERRUPTED_MESSAGE: &str = "interrupted: service stopped while job was running";

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record with this id exists.
    #[error("job {0} not found")]
    NotFound(u64),

    /// Only completed or failed records can be reprocessed.
    #[error("job {id} cannot be reprocessed while {status}")]
    NotReprocessable { id: u64, status: JobStatus },

    /// Requested status change breaks the lifecycle order.
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: u64,
        from: JobStatus,
        to: JobStatus,
    },

    /// The store has been closed.
    #[error("job store is closed")]
    Closed,

    /// Persistence IO failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Record could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether this error means the persistence backend itself is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::Serialization(_))
    }
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet claimed by a worker.
    #[default]
    Pending,
    /// A worker is transcoding it.
    Running,
    /// Transcode succeeded.
    Completed,
    /// Transcode failed or was interrupted.
    Failed,
}

impl JobStatus {
    /// Whether the status is final.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `self -> next` is an allowed lifecycle step.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Durable record of one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub id: u64,
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Profile table key, used to resolve the profile again on reprocess.
    pub profile_key: String,
    /// Profile display name at the time the job was created.
    pub profile_name: String,
    /// Target video codec of the profile.
    #[serde(default)]
    pub video_codec: Option<String>,
    pub status: JobStatus,
    /// Unix timestamps in milliseconds.
    pub created_at: i64,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub original_size: Option<u64>,
    #[serde(default)]
    pub final_size: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    /// Wall-clock processing time in seconds.
    #[serde(default)]
    pub processing_secs: Option<f64>,
    #[serde(default)]
    pub hardware_accel_used: bool,
}

impl JobRecord {
    /// original / final, defined only when both sizes are known and final is non-zero.
    pub fn compression_ratio(&self) -> Option<f64> {
        match (self.original_size, self.final_size) {
            (Some(original), Some(final_size)) if final_size > 0 => {
                Some(original as f64 / final_size as f64)
            }
            _ => None,
        }
    }

    /// max(0, original - final), defined under the same conditions as the ratio.
    pub fn space_saved(&self) -> Option<u64> {
        match (self.original_size, self.final_size) {
            (Some(original), Some(final_size)) if final_size > 0 => {
                Some(original.saturating_sub(final_size))
            }
            _ => None,
        }
    }

    /// Space saved as a percentage of the original size.
    pub fn space_saved_percentage(&self) -> Option<f64> {
        let saved = self.space_saved()?;
        let original = self.original_size?;
        if original == 0 {
            return None;
        }
        Some(saved as f64 / original as f64 * 100.0)
    }
}

/// Fields for a new record; the store assigns id, status and timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub profile_key: String,
    pub profile_name: String,
    pub video_codec: Option<String>,
}

/// Partial update applied atomically to a record.
///
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordUpdate {
    pub status: Option<JobStatus>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub original_size: Option<u64>,
    pub final_size: Option<u64>,
    pub error: Option<String>,
    pub processing_secs: Option<f64>,
    pub hardware_accel_used: Option<bool>,
}

impl RecordUpdate {
    /// Claimed by a worker.
    pub fn running() -> Self {
        Self {
            status: Some(JobStatus::Running),
            started_at: Some(current_timestamp_ms()),
            ..Self::default()
        }
    }

    /// Engine reported success.
    pub fn completed(
        original_size: u64,
        final_size: Option<u64>,
        processing_secs: f64,
        hardware_accel_used: bool,
    ) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            completed_at: Some(current_timestamp_ms()),
            original_size: Some(original_size),
            final_size,
            processing_secs: Some(processing_secs),
            hardware_accel_used: Some(hardware_accel_used),
            ..Self::default()
        }
    }

    /// Job failed with `error`.
    pub fn failed(error: impl Into<String>, processing_secs: Option<f64>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            completed_at: Some(current_timestamp_ms()),
            error: Some(error.into()),
            processing_secs,
            ..Self::default()
        }
    }

    fn apply(self, record: &mut JobRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(v) = self.started_at {
            record.started_at = Some(v);
        }
        if let Some(v) = self.completed_at {
            record.completed_at = Some(v);
        }
        if let Some(v) = self.original_size {
            record.original_size = Some(v);
        }
        if let Some(v) = self.final_size {
            record.final_size = Some(v);
        }
        if let Some(v) = self.error {
            record.error = Some(v);
        }
        if let Some(v) = self.processing_secs {
            record.processing_secs = Some(v);
        }
        if let Some(v) = self.hardware_accel_used {
            record.hardware_accel_used = v;
        }
    }
}

/// Number of records per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

struct StoreInner {
    records: BTreeMap<u64, JobRecord>,
    next_id: u64,
}

/// Persistent job state store.
pub struct JobStateStore {
    dir: PathBuf,
    inner: RwLock<StoreInner>,
    closed: AtomicBool,
}

impl JobStateStore {
    /// Open the store in `dir`, creating the directory if needed.
    ///
    /// Records left `running` by a previous process are marked failed, since
    /// no worker owns them any more.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let (loaded, highest_file_id) = load_records(&dir)?;
        let mut records = BTreeMap::new();
        for record in loaded {
            records.insert(record.id, record);
        }

        let mut interrupted = 0;
        for record in records.values_mut() {
            if record.status == JobStatus::Running {
                RecordUpdate::failed(INTERRUPTED_MESSAGE, None).apply(record);
                write_record(&dir, record).await?;
                interrupted += 1;
            }
        }

        // Ids of unreadable files stay reserved so they are never overwritten
        let next_id = records
            .keys()
            .next_back()
            .copied()
            .max(highest_file_id)
            .map(|id| id + 1)
            .unwrap_or(1);

        info!(
            dir = %dir.display(),
            records = records.len(),
            interrupted,
            "job store opened"
        );

        Ok(Self {
            dir,
            inner: RwLock::new(StoreInner { records, next_id }),
            closed: AtomicBool::new(false),
        })
    }

    /// State directory backing this store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// Create and persist a new `pending` record.
    pub async fn add_record(&self, new: NewRecord) -> Result<JobRecord, StoreError> {
        self.ensure_open()?;
        let mut inner = self.inner.write().await;

        let record = JobRecord {
            id: inner.next_id,
            source: new.source,
            destination: new.destination,
            profile_key: new.profile_key,
            profile_name: new.profile_name,
            video_codec: new.video_codec,
            status: JobStatus::Pending,
            created_at: current_timestamp_ms(),
            started_at: None,
            completed_at: None,
            original_size: None,
            final_size: None,
            error: None,
            processing_secs: None,
            hardware_accel_used: false,
        };

        write_record(&self.dir, &record).await?;
        inner.next_id += 1;
        inner.records.insert(record.id, record.clone());
        Ok(record)
    }

    /// Apply `update` to record `id`.
    ///
    /// The update is persisted before it becomes visible; on any error the
    /// in-memory record is unchanged.
    pub async fn update_record(
        &self,
        id: u64,
        update: RecordUpdate,
    ) -> Result<JobRecord, StoreError> {
        self.ensure_open()?;
        let mut inner = self.inner.write().await;

        let current = inner.records.get(&id).ok_or(StoreError::NotFound(id))?;
        let next = update.status.unwrap_or(current.status);
        // Terminal records are frozen, even for same-status or field-only updates
        if current.status.is_terminal()
            || (next != current.status && !current.status.can_transition_to(next))
        {
            return Err(StoreError::InvalidTransition {
                id,
                from: current.status,
                to: next,
            });
        }

        let mut updated = current.clone();
        update.apply(&mut updated);
        write_record(&self.dir, &updated).await?;
        inner.records.insert(id, updated.clone());
        Ok(updated)
    }

    /// Clone a terminal record into a fresh `pending` record.
    ///
    /// The original record is left untouched.
    pub async fn reprocess(&self, id: u64) -> Result<JobRecord, StoreError> {
        self.ensure_open()?;
        let template = {
            let inner = self.inner.read().await;
            let original = inner.records.get(&id).ok_or(StoreError::NotFound(id))?;
            if !original.status.is_terminal() {
                return Err(StoreError::NotReprocessable {
                    id,
                    status: original.status,
                });
            }
            NewRecord {
                source: original.source.clone(),
                destination: original.destination.clone(),
                profile_key: original.profile_key.clone(),
                profile_name: original.profile_name.clone(),
                video_codec: original.video_codec.clone(),
            }
        };

        let record = self.add_record(template).await?;
        info!(original = id, new = record.id, "job reprocessed");
        Ok(record)
    }

    pub async fn get(&self, id: u64) -> Option<JobRecord> {
        self.inner.read().await.records.get(&id).cloned()
    }

    /// Records with `status`, oldest first.
    pub async fn list_by_status(&self, status: JobStatus) -> Vec<JobRecord> {
        self.inner
            .read()
            .await
            .records
            .values()
            .filter(|record| record.status == status)
            .cloned()
            .collect()
    }

    /// Every record, oldest first.
    pub async fn list_all(&self) -> Vec<JobRecord> {
        self.inner.read().await.records.values().cloned().collect()
    }

    /// The `limit` most recently created records, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<JobRecord> {
        self.inner
            .read()
            .await
            .records
            .values()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn counts(&self) -> StatusCounts {
        let inner = self.inner.read().await;
        let mut counts = StatusCounts::default();
        for record in inner.records.values() {
            match record.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Pending records that no queue entry refers to yet.
    ///
    /// Only meaningful right after [`JobStateStore::open`], before any worker
    /// runs: every pending record at that point was left over by a previous
    /// process.
    pub async fn recoverable_pending(&self) -> Vec<JobRecord> {
        self.list_by_status(JobStatus::Pending).await
    }

    /// Refuse further mutations. Reads keep working.
    pub async fn close(&self) {
        // Wait for any in-progress write to finish first
        let _inner = self.inner.write().await;
        self.closed.store(true, Ordering::SeqCst);
        info!(dir = %self.dir.display(), "job store closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn record_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{}.json", id))
}

/// Persist `record` through a temporary file and rename.
async fn write_record(dir: &Path, record: &JobRecord) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(record)?;
    let final_path = record_path(dir, record.id);
    let tmp_path = dir.join(format!(".{}.json.tmp", record.id));

    tokio::fs::write(&tmp_path, json).await?;
    tokio::fs::rename(&tmp_path, &final_path).await?;
    Ok(())
}

/// Load all records from `dir`, skipping files that fail to parse.
///
/// Also returns the highest id named by any `<id>.json` file, readable or not.
fn load_records(dir: &Path) -> Result<(Vec<JobRecord>, Option<u64>), io::Error> {
    let mut records = Vec::new();
    let mut highest_file_id = None;

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();

        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<u64>().ok())
        {
            highest_file_id = highest_file_id.max(Some(id));
        }

        match load_record_from_file(&path) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable job record");
            }
        }
    }

    Ok((records, highest_file_id))
}

fn load_record_from_file(path: &Path) -> Result<JobRecord, io::Error> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
