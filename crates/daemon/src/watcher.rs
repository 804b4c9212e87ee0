//! Directory watching and candidate evaluation.
//!
//! One [`FileWatcher`] runs per watch target. Filesystem events and the
//! initial scan feed candidate paths into a single context task that owns the
//! deduplication sets, so a path is evaluated by at most one task at a time
//! and enqueued at most once while it is in flight.
//!
//! Evaluation of a candidate, in order:
//! 1. wait for the file size to stabilize
//! 2. skip it if an output for any profile already exists
//! 3. resolve the target's profile
//! 4. ask the decision function whether the file needs processing
//! 5. compute the destination and create its directory
//! 6. enqueue a job

use crate::decision::NeedsProcessing;
use crate::destination::{compute_destination, ensure_parent_dir, existing_destination};
use crate::job::{JobFeedback, JobOutcome, JobRequest, WatchOrigin};
use crate::queue::JobQueue;
use crate::scan::{is_temporary_output, scan_target};
use crate::stability::{wait_until_stable, StabilityPolicy};
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use recodex_config::{find_profile, Profile, ProfileTable, WatchTarget};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Error type for starting a watcher.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The watch directory does not exist.
    #[error("Watch directory does not exist: {}", .0.display())]
    MissingDirectory(PathBuf),

    /// The platform watcher could not be created or attached.
    #[error("Filesystem watch error: {0}")]
    Notify(#[from] notify::Error),
}

/// Shared resources every watcher needs.
#[derive(Clone)]
pub struct WatcherDeps {
    pub profiles: Arc<ProfileTable>,
    pub queue: JobQueue,
    pub decision: Arc<dyn NeedsProcessing>,
    pub stability: StabilityPolicy,
}

/// Point-in-time view of a watcher's deduplication state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupSnapshot {
    pub processed: Vec<PathBuf>,
    pub in_flight: Vec<PathBuf>,
    pub checking: Vec<PathBuf>,
}

/// Result of evaluating one candidate.
#[derive(Debug)]
enum Verdict {
    Enqueue {
        destination: PathBuf,
        profile_key: String,
        profile: Profile,
    },
    /// Nothing to do for this path, now or later.
    Processed,
    /// Not handled this time; a later event may bring it back.
    Retry,
}

enum WatchCommand {
    Candidate(PathBuf),
    Evaluated { path: PathBuf, verdict: Verdict },
    Snapshot(oneshot::Sender<DedupSnapshot>),
    Stop,
}

/// Paths carried by an event that may be new files.
///
/// Creations and renames into the tree count. For a rename that reports both
/// ends, only the destination counts.
pub fn candidate_paths(event: &Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(CreateKind::File) | EventKind::Create(CreateKind::Any) => {
            event.paths.clone()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths.clone(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.get(1).cloned().into_iter().collect()
        }
        // Platforms that cannot tell the two ends apart report `Any`
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => event
            .paths
            .iter()
            .filter(|path| path.is_file())
            .cloned()
            .collect(),
        _ => Vec::new(),
    }
}

/// A running watcher for one watch target.
pub struct FileWatcher {
    target: Arc<WatchTarget>,
    commands: mpsc::UnboundedSender<WatchCommand>,
    task: JoinHandle<()>,
    _watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Start watching `target`.
    ///
    /// Files already present are scanned once after the platform watcher is
    /// attached, so nothing created in between is missed.
    pub fn start(target: WatchTarget, deps: WatcherDeps) -> Result<Self, WatchError> {
        if !target.path.is_dir() {
            return Err(WatchError::MissingDirectory(target.path.clone()));
        }

        let target = Arc::new(target);
        let (commands, command_rx) = mpsc::unbounded_channel();

        let events = commands.clone();
        let watch_path = target.path.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for path in candidate_paths(&event) {
                    if events.send(WatchCommand::Candidate(path)).is_err() {
                        debug!(watch = %watch_path.display(), "event after watcher stopped");
                    }
                }
            }
            Err(e) => warn!(watch = %watch_path.display(), error = %e, "filesystem watch error"),
        })?;

        let mode = if target.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(&target.path, mode)?;

        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        let context = WatchContext {
            target: target.clone(),
            deps,
            commands: commands.clone(),
            feedback_tx,
            processed: HashSet::new(),
            in_flight: HashSet::new(),
            checking: HashSet::new(),
        };
        let task = tokio::spawn(context.run(command_rx, feedback_rx));

        info!(
            watch = %target.path.display(),
            profile = %target.profile,
            recursive = target.recursive,
            "watching directory"
        );

        Ok(Self {
            target,
            commands,
            task,
            _watcher: watcher,
        })
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    /// Feed a path through the same handling as a filesystem event.
    pub fn notify_path(&self, path: impl Into<PathBuf>) {
        if let Err(e) = self.commands.send(WatchCommand::Candidate(path.into())) {
            if let WatchCommand::Candidate(path) = e.0 {
                debug!(
                    watch = %self.target.path.display(),
                    path = %path.display(),
                    "path notified after watcher stopped"
                );
            }
        }
    }

    /// Current deduplication state, or `None` if the watcher has stopped.
    pub async fn snapshot(&self) -> Option<DedupSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(WatchCommand::Snapshot(tx)).ok()?;
        rx.await.ok()
    }

    /// Stop watching and wait for the context task to exit.
    ///
    /// Evaluations still running are abandoned; their paths are not marked.
    pub async fn stop(self) {
        let watch = self.target.path.clone();
        drop(self._watcher);
        let _ = self.commands.send(WatchCommand::Stop);
        if let Err(e) = self.task.await {
            error!(watch = %watch.display(), error = %e, "watcher task failed");
        }
        info!(watch = %watch.display(), "watcher stopped");
    }
}

struct WatchContext {
    target: Arc<WatchTarget>,
    deps: WatcherDeps,
    commands: mpsc::UnboundedSender<WatchCommand>,
    feedback_tx: mpsc::UnboundedSender<JobFeedback>,
    processed: HashSet<PathBuf>,
    in_flight: HashSet<PathBuf>,
    checking: HashSet<PathBuf>,
}

impl WatchContext {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<WatchCommand>,
        mut feedback: mpsc::UnboundedReceiver<JobFeedback>,
    ) {
        let scan_target_copy = self.target.clone();
        match tokio::task::spawn_blocking(move || scan_target(&scan_target_copy)).await {
            Ok(existing) => {
                debug!(
                    watch = %self.target.path.display(),
                    files = existing.len(),
                    "initial scan complete"
                );
                for path in existing {
                    self.on_candidate(path);
                }
            }
            Err(e) => error!(watch = %self.target.path.display(), error = %e, "initial scan failed"),
        }

        loop {
            tokio::select! {
                Some(command) = commands.recv() => match command {
                    WatchCommand::Candidate(path) => self.on_candidate(path),
                    WatchCommand::Evaluated { path, verdict } => self.on_evaluated(path, verdict),
                    WatchCommand::Snapshot(reply) => {
                        let _ = reply.send(self.snapshot());
                    }
                    WatchCommand::Stop => break,
                },
                Some(message) = feedback.recv() => self.on_feedback(message).await,
                else => break,
            }
        }
    }

    fn on_candidate(&mut self, path: PathBuf) {
        if !self.target.accepts_extension(&path) || is_temporary_output(&path) {
            return;
        }
        if self.processed.contains(&path)
            || self.in_flight.contains(&path)
            || self.checking.contains(&path)
        {
            debug!(path = %path.display(), "duplicate candidate ignored");
            return;
        }

        self.checking.insert(path.clone());

        let target = self.target.clone();
        let deps = self.deps.clone();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            // Inner task so a panic still releases the path
            let verdict = match tokio::spawn(evaluate(path.clone(), target, deps)).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "candidate evaluation panicked");
                    Verdict::Retry
                }
            };
            if commands.send(WatchCommand::Evaluated { path, verdict }).is_err() {
                debug!("watcher stopped before evaluation finished");
            }
        });
    }

    fn on_evaluated(&mut self, path: PathBuf, verdict: Verdict) {
        self.checking.remove(&path);

        match verdict {
            Verdict::Enqueue {
                destination,
                profile_key,
                profile,
            } => {
                self.in_flight.insert(path.clone());
                let origin = WatchOrigin::new(self.target.path.clone(), self.feedback_tx.clone());
                let request =
                    JobRequest::new(path.clone(), destination, profile_key, profile).with_origin(origin);
                info!(
                    source = %path.display(),
                    destination = %request.destination.display(),
                    profile = %request.profile_key,
                    "job enqueued"
                );
                self.deps.queue.enqueue(request);
            }
            Verdict::Processed => {
                self.processed.insert(path);
            }
            Verdict::Retry => {}
        }
    }

    async fn on_feedback(&mut self, message: JobFeedback) {
        self.in_flight.remove(&message.source);

        match message.outcome {
            JobOutcome::Completed => {
                if self.target.delete_source {
                    match tokio::fs::remove_file(&message.source).await {
                        Ok(()) => info!(source = %message.source.display(), "source deleted"),
                        Err(e) => warn!(
                            source = %message.source.display(),
                            error = %e,
                            "failed to delete source"
                        ),
                    }
                }
                self.processed.insert(message.source);
            }
            JobOutcome::Failed => {
                debug!(source = %message.source.display(), "job failed, path may be retried");
            }
        }
    }

    fn snapshot(&self) -> DedupSnapshot {
        let sorted = |set: &HashSet<PathBuf>| {
            let mut paths: Vec<PathBuf> = set.iter().cloned().collect();
            paths.sort();
            paths
        };
        DedupSnapshot {
            processed: sorted(&self.processed),
            in_flight: sorted(&self.in_flight),
            checking: sorted(&self.checking),
        }
    }
}

async fn evaluate(path: PathBuf, target: Arc<WatchTarget>, deps: WatcherDeps) -> Verdict {
    wait_until_stable(&path, &deps.stability).await;

    if !path.is_file() {
        debug!(path = %path.display(), "candidate vanished before evaluation");
        return Verdict::Retry;
    }

    let output_dir = target.output_dir.as_deref();
    if let Some(existing) = existing_destination(&path, &deps.profiles, output_dir) {
        debug!(
            path = %path.display(),
            output = %existing.display(),
            "output already exists, skipping"
        );
        return Verdict::Processed;
    }

    let Some((profile_key, profile)) = find_profile(&deps.profiles, &target.profile) else {
        error!(
            path = %path.display(),
            profile = %target.profile,
            "watch target references an unknown profile"
        );
        return Verdict::Retry;
    };

    match deps.decision.needs_processing(&path, profile).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(path = %path.display(), profile = profile_key, "no processing needed");
            return Verdict::Processed;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "decision failed, skipping file");
            return Verdict::Processed;
        }
    }

    let destination = compute_destination(&path, profile, output_dir);
    if let Err(e) = ensure_parent_dir(&destination) {
        error!(
            destination = %destination.display(),
            error = %e,
            "cannot create output directory"
        );
        return Verdict::Retry;
    }

    Verdict::Enqueue {
        destination,
        profile_key: profile_key.to_string(),
        profile: profile.clone(),
    }
}
