//! Job requests handed from detection to execution.

use recodex_config::Profile;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::warn;

/// Terminal result reported back to the watcher that produced a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
}

/// Message from a worker to the originating watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFeedback {
    pub source: PathBuf,
    pub outcome: JobOutcome,
}

/// Link from a job back to the watcher that produced it.
#[derive(Debug, Clone)]
pub struct WatchOrigin {
    /// Directory of the watch target.
    pub watch_path: PathBuf,
    feedback: mpsc::UnboundedSender<JobFeedback>,
}

impl WatchOrigin {
    pub fn new(watch_path: PathBuf, feedback: mpsc::UnboundedSender<JobFeedback>) -> Self {
        Self {
            watch_path,
            feedback,
        }
    }

    /// Report a terminal outcome for `source`.
    ///
    /// The watcher may already have stopped; that is logged, not an error.
    pub fn report(&self, source: PathBuf, outcome: JobOutcome) {
        if let Err(e) = self.feedback.send(JobFeedback { source, outcome }) {
            warn!(
                watch = %self.watch_path.display(),
                source = %e.0.source.display(),
                "watcher no longer listening for job feedback"
            );
        }
    }
}

/// A unit of work waiting for a worker.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Key of the resolved profile in the profile table.
    pub profile_key: String,
    pub profile: Profile,
    /// Watcher that produced the request; `None` for manual submissions.
    pub origin: Option<WatchOrigin>,
    /// Existing `pending` record to adopt instead of creating one.
    pub record_id: Option<u64>,
}

impl JobRequest {
    pub fn new(
        source: PathBuf,
        destination: PathBuf,
        profile_key: impl Into<String>,
        profile: Profile,
    ) -> Self {
        Self {
            source,
            destination,
            profile_key: profile_key.into(),
            profile,
            origin: None,
            record_id: None,
        }
    }

    pub fn with_origin(mut self, origin: WatchOrigin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_record(mut self, record_id: u64) -> Self {
        self.record_id = Some(record_id);
        self
    }

    /// Tell the originating watcher how the job ended, if there is one.
    pub fn report(&self, outcome: JobOutcome) {
        if let Some(origin) = &self.origin {
            origin.report(self.source.clone(), outcome);
        }
    }
}
