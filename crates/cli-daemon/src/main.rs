//! `recodex` command line.
//!
//! `run` starts the daemon in the foreground; the other subcommands talk to a
//! running daemon over its HTTP API.

mod client;
mod logging;
mod output;

use clap::{Parser, Subcommand};
use client::{ApiClient, ClientError, DEFAULT_URL};
use recodex_daemon::{Config, Daemon};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// RecodeX - watch-folder transcoding daemon
#[derive(Parser, Debug)]
#[command(name = "recodex")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Daemon API base URL used by the client subcommands
    #[arg(long, global = true, default_value = DEFAULT_URL)]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon in the foreground
    Run {
        /// Path to the configuration file
        #[arg(short, long, default_value = "recodex.toml")]
        config: PathBuf,

        /// Simulate transcodes and skip tool checks
        #[arg(long)]
        dry_run: bool,
    },
    /// Write a configuration file with the default settings and profiles
    InitConfig {
        #[arg(default_value = "recodex.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// List jobs, optionally filtered by status
    Jobs {
        /// pending, running, completed or failed
        #[arg(short, long)]
        status: Option<String>,
    },
    /// Show a single job
    Show { id: u64 },
    /// Queue a file for transcoding
    Submit {
        source: PathBuf,

        /// Profile key or display name
        #[arg(short, long)]
        profile: String,

        /// Explicit output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Re-run a completed or failed job under a new record
    Reprocess { id: u64 },
    /// Aggregate statistics over all jobs
    Stats,
    /// Current worker activity
    Workers,
    /// Profiles and watch folders the daemon is running with
    ConfigShow,
    /// Daemon overview: watchers, workers, queue and job counts
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, dry_run } => run_daemon(&config, dry_run).await,
        Command::InitConfig { path, force } => init_config(&path, force),
        command => {
            let client = ApiClient::new(cli.server);
            match run_client(&client, command).await {
                Ok(text) => {
                    println!("{}", text);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

async fn run_daemon(path: &Path, dry_run: bool) -> ExitCode {
    let mut config = match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading {}: {}", path.display(), e);
            eprintln!("Run `recodex init-config` to create one.");
            return ExitCode::FAILURE;
        }
    };
    if dry_run {
        config.worker.dry_run = true;
    }

    let _guard = logging::init(&config.logging);
    tracing::info!(config = %path.display(), dry_run = config.worker.dry_run, "RecodeX starting");

    let daemon = match Daemon::from_config(config).await {
        Ok(daemon) => daemon,
        Err(e) => {
            tracing::error!("Failed to initialize daemon: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match daemon.run_with_server().await {
        Ok(()) => {
            tracing::info!("RecodeX stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("Daemon error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_config(path: &Path, force: bool) -> ExitCode {
    match write_default_config(path, force) {
        Ok(()) => {
            println!("Wrote {}", path.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn write_default_config(path: &Path, force: bool) -> Result<(), String> {
    if path.exists() && !force {
        return Err(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }
    let text = Config::default()
        .to_toml_string()
        .map_err(|e| e.to_string())?;
    std::fs::write(path, text).map_err(|e| format!("writing {}: {}", path.display(), e))
}

async fn run_client(client: &ApiClient, command: Command) -> Result<String, ClientError> {
    let text = match command {
        Command::Jobs { status } => {
            let jobs = client.jobs(status.as_deref()).await?;
            if jobs.is_empty() {
                "no jobs".to_string()
            } else {
                jobs.iter()
                    .map(output::job_line)
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        Command::Show { id } => output::job_detail(&client.job(id).await?),
        Command::Submit {
            source,
            profile,
            output,
        } => {
            let source = std::path::absolute(&source).unwrap_or(source);
            let job = client.submit(source, &profile, output).await?;
            format!(
                "queued {} -> {} ({})",
                job.source.display(),
                job.destination.display(),
                job.profile_name
            )
        }
        Command::Reprocess { id } => {
            let view = client.reprocess(id).await?;
            format!("job #{} requeued as #{}", id, view.record.id)
        }
        Command::Stats => output::stats_text(&client.stats().await?),
        Command::Workers => output::workers_text(&client.workers().await?),
        Command::ConfigShow => output::config_text(&client.config().await?),
        Command::Status => output::status_text(&client.status().await?),
        Command::Run { .. } | Command::InitConfig { .. } => String::new(),
    };
    Ok(text)
}
