//! Daemon lifecycle: wiring, startup, serving and ordered shutdown.

use crate::api::{run_server, ServerError};
use crate::decision::{AlwaysProcess, FfprobeDecision, NeedsProcessing};
use crate::engine::{DryRunEngine, FfmpegEngine, TranscodeEngine};
use crate::queue::JobQueue;
use crate::service::{JobService, ServiceError, SubmittedJob};
use crate::stability::StabilityPolicy;
use crate::stats::{RecordView, StatisticsReport};
use crate::startup::{run_startup_checks, StartupError};
use crate::store::{JobRecord, JobStateStore, JobStatus, StoreError};
use crate::watcher::{FileWatcher, WatcherDeps};
use crate::worker::{PoolSettings, WorkerBoard, WorkerPool};
use recodex_config::Config;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Job store could not be opened or failed while running
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    /// A service operation failed
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// API server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// The running orchestration engine.
pub struct Daemon {
    config: Config,
    service: Arc<JobService>,
    board: WorkerBoard,
    engine: Arc<dyn TranscodeEngine>,
    decision: Arc<dyn NeedsProcessing>,
    pool: Option<WorkerPool>,
    watchers: Vec<FileWatcher>,
    fatal_tx: mpsc::UnboundedSender<StoreError>,
    fatal_rx: mpsc::UnboundedReceiver<StoreError>,
}

impl Daemon {
    /// Open the job store and build the queue.
    ///
    /// Records left `running` by a previous process are marked failed here;
    /// leftover `pending` records are queued again by [`Daemon::start`].
    pub async fn new(
        config: Config,
        engine: Arc<dyn TranscodeEngine>,
        decision: Arc<dyn NeedsProcessing>,
    ) -> Result<Self, DaemonError> {
        let store = Arc::new(JobStateStore::open(&config.state.dir).await?);
        let board = WorkerBoard::new(config.worker.max_workers);
        let service = Arc::new(
            JobService::new(
                store,
                JobQueue::new(),
                Arc::new(config.profiles.clone()),
                board.clone(),
            )
            .with_watch_targets(config.watch.clone())
            .with_dry_run(config.worker.dry_run),
        );
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            service,
            board,
            engine,
            decision,
            pool: None,
            watchers: Vec::new(),
            fatal_tx,
            fatal_rx,
        })
    }

    /// Build a daemon with the engine and decision the configuration asks for.
    ///
    /// Dry runs use the simulated engine and accept every file; otherwise
    /// ffmpeg/ffprobe are checked and used.
    pub async fn from_config(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;

        let (engine, decision): (Arc<dyn TranscodeEngine>, Arc<dyn NeedsProcessing>) =
            if config.worker.dry_run {
                (Arc::new(DryRunEngine::default()), Arc::new(AlwaysProcess))
            } else {
                (
                    Arc::new(FfmpegEngine::new(&config.engine)),
                    Arc::new(FfprobeDecision::new(config.engine.ffprobe_path.clone())),
                )
            };

        Self::new(config, engine, decision).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared handle for API handlers and other observers.
    pub fn service(&self) -> Arc<JobService> {
        self.service.clone()
    }

    pub fn watchers(&self) -> &[FileWatcher] {
        &self.watchers
    }

    /// Start workers, resume leftover jobs and attach watchers.
    ///
    /// A watch target whose directory is missing is logged and skipped.
    pub async fn start(&mut self) -> Result<(), DaemonError> {
        if self.pool.is_some() {
            return Ok(());
        }

        self.pool = Some(WorkerPool::start(
            PoolSettings::from(&self.config.worker),
            self.board.clone(),
            self.service.queue().clone(),
            self.service.store().clone(),
            self.engine.clone(),
            self.fatal_tx.clone(),
        ));

        self.service.requeue_pending().await?;

        for target in self.config.unresolved_watch_targets() {
            warn!(
                watch = %target.path.display(),
                profile = %target.profile,
                "watch target references an unknown profile; its files will be skipped"
            );
        }

        let deps = WatcherDeps {
            profiles: self.service.profiles().clone(),
            queue: self.service.queue().clone(),
            decision: self.decision.clone(),
            stability: StabilityPolicy::from(&self.config.stability),
        };
        for target in &self.config.watch {
            match FileWatcher::start(target.clone(), deps.clone()) {
                Ok(watcher) => self.watchers.push(watcher),
                Err(e) => warn!(
                    watch = %target.path.display(),
                    error = %e,
                    "watch target skipped"
                ),
            }
        }

        self.service
            .set_watching(
                self.watchers
                    .iter()
                    .map(|watcher| watcher.target().path.clone())
                    .collect(),
            )
            .await;

        info!(
            workers = self.board.len(),
            watchers = self.watchers.len(),
            dry_run = self.config.worker.dry_run,
            "daemon started"
        );
        Ok(())
    }

    pub fn submit(
        &self,
        source: PathBuf,
        profile_ref: &str,
        destination: Option<PathBuf>,
    ) -> Result<SubmittedJob, DaemonError> {
        Ok(self.service.submit(source, profile_ref, destination)?)
    }

    pub async fn reprocess(&self, id: u64) -> Result<JobRecord, DaemonError> {
        Ok(self.service.reprocess(id).await?)
    }

    pub async fn list_by_status(&self, status: JobStatus) -> Vec<RecordView> {
        self.service.list(Some(status)).await
    }

    pub async fn statistics(&self) -> StatisticsReport {
        self.service.statistics().await
    }

    /// Stop workers, then watchers, then close the store.
    ///
    /// Jobs already running are allowed to finish.
    pub async fn shutdown(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.stop().await;
        }
        for watcher in self.watchers.drain(..) {
            watcher.stop().await;
        }
        self.service.set_watching(Vec::new()).await;
        self.service.store().close().await;
        info!("daemon stopped");
    }

    /// Start everything, serve the API and run until ctrl-c or a fatal
    /// store failure, then shut down in order.
    pub async fn run_with_server(mut self) -> Result<(), DaemonError> {
        self.start().await?;

        let addr = self.config.server.address();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let mut server = tokio::spawn({
            let service = self.service();
            async move {
                run_server(service, &addr, async {
                    let _ = stop_rx.await;
                })
                .await
            }
        });

        let mut outcome = Ok(());
        let mut server_done = false;
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!(error = %e, "failed to listen for ctrl-c");
                }
                info!("shutdown requested");
            }
            Some(e) = self.fatal_rx.recv() => {
                error!(error = %e, "job store failed, shutting down");
                outcome = Err(DaemonError::Store(e));
            }
            result = &mut server => {
                server_done = true;
                match result {
                    Ok(Ok(())) => info!("API server exited"),
                    Ok(Err(e)) => outcome = Err(DaemonError::Server(e)),
                    Err(e) => error!(error = %e, "API server task failed"),
                }
            }
        }

        let _ = stop_tx.send(());
        if !server_done {
            match server.await {
                Ok(Err(e)) => error!(error = %e, "API server error during shutdown"),
                Err(e) => error!(error = %e, "API server task failed"),
                Ok(Ok(())) => {}
            }
        }

        self.shutdown().await;
        outcome
    }
}
