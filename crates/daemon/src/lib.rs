//! RecodeX daemon
//!
//! Watch-folder transcoding orchestration: directory watchers detect new media,
//! a shared queue feeds a pool of workers, and every job's lifecycle is kept
//! in a persistent state store that also backs statistics and reprocessing.

pub mod api;
pub mod daemon;
pub mod decision;
pub mod destination;
pub mod engine;
pub mod job;
pub mod probe;
pub mod queue;
pub mod scan;
pub mod service;
pub mod stability;
pub mod startup;
pub mod stats;
pub mod store;
pub mod watcher;
pub mod worker;

pub use recodex_config as config;
pub use recodex_config::Config;
pub use api::{create_router, run_server, ApiError, ServerError};
pub use daemon::{Daemon, DaemonError};
pub use decision::{should_transcode, AlwaysProcess, FfprobeDecision, NeedsProcessing};
pub use destination::{compute_destination, existing_destination};
pub use engine::{
    DryRunEngine, EngineError, FfmpegEngine, ProgressSink, TranscodeEngine, TranscodeOutcome,
};
pub use job::{JobFeedback, JobOutcome, JobRequest, WatchOrigin};
pub use queue::JobQueue;
pub use service::{
    ConfigReport, JobService, ServiceError, StatusReport, SubmittedJob, WorkersReport,
};
pub use stability::{wait_until_stable, StabilityPolicy, StabilityResult, StabilityTracker};
pub use startup::{run_startup_checks, StartupError};
pub use stats::{GroupStats, RecordView, StatisticsReport};
pub use store::{
    JobRecord, JobStateStore, JobStatus, NewRecord, RecordUpdate, StatusCounts, StoreError,
};
pub use watcher::{DedupSnapshot, FileWatcher, WatchError, WatcherDeps};
pub use worker::{PoolSettings, WorkerBoard, WorkerPool, WorkerSnapshot, WorkerState};
