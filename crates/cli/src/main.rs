//! CLI entry point for the video upscaler
//!
//! `add` queues one file, `scan` queues every eligible episode under a
//! directory, and `worker` processes the queue until interrupted, optionally
//! exporting metrics over HTTP.

use clap::{Parser, Subcommand};
use std::error::Error;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use video_upscaler::{
    new_shared_metrics, run_metrics_server, run_startup_checks, Config, FileQueue, Priority,
    ScanRules, Scanner, SubmitError, SubmitOptions, Submitter, UpscaleTask, Upscaler, Worker,
};

type CliResult = Result<ExitCode, Box<dyn Error>>;

/// Chunked, resumable 1080p to 2160p video upscaler
#[derive(Parser, Debug)]
#[command(name = "video-upscaler")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; defaults apply when it does not exist
    #[arg(short, long, global = true, default_value = "/etc/video-upscaler/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Queue a single file for upscaling
    Add {
        /// Queue lane: critical, default or low
        #[arg(short, long, default_value = "default")]
        priority: Priority,

        /// Replace a task with the same output that is already queued or retained
        #[arg(short, long)]
        force: bool,

        /// HD source file
        input: PathBuf,

        /// Destination; derived from the input name's HD tag when omitted
        output: Option<PathBuf>,
    },

    /// Queue every HD episode without a UHD counterpart below a marker file
    Scan {
        /// Directory to scan
        root: PathBuf,
    },

    /// Process queued tasks until interrupted
    Worker {
        /// Skip the ffmpeg/ffprobe/vspipe availability checks
        #[arg(long, default_value = "false")]
        skip_checks: bool,

        /// Serve /metrics and /health on this address (e.g. 0.0.0.0:9090 or :9090);
        /// overrides worker.metrics_exporter and METRICS_EXPORTER
        #[arg(long, value_name = "ADDR")]
        metrics_exporter: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(config = %args.config.display(), "Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match args.command {
        Command::Add {
            priority,
            force,
            input,
            output,
        } => add(&config, priority, force, &input, output.as_deref()).await,
        Command::Scan { root } => scan(&config, &root).await,
        Command::Worker {
            skip_checks,
            metrics_exporter,
        } => {
            let exporter = metrics_exporter.or_else(|| config.worker.metrics_exporter.clone());
            worker(&config, skip_checks, exporter.as_deref()).await
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn open_submitter(config: &Config) -> Result<Submitter, Box<dyn Error>> {
    let queue = FileQueue::open(&config.queue.state_dir).await?;
    Ok(Submitter::new(
        Arc::new(queue),
        SubmitOptions::from_config(&config.queue),
    ))
}

async fn add(
    config: &Config,
    priority: Priority,
    force: bool,
    input: &Path,
    output: Option<&Path>,
) -> CliResult {
    let input = tokio::fs::canonicalize(input)
        .await
        .map_err(|e| format!("Input file {} is not accessible: {}", input.display(), e))?;
    if !input.is_file() {
        return Err(format!("Input {} is not a file", input.display()).into());
    }

    let output = match output {
        Some(path) => std::path::absolute(path)?,
        None => ScanRules::from_config(&config.scanner)
            .destination(&input)
            .ok_or_else(|| {
                format!(
                    "Cannot derive an output name: {} does not contain '{}'",
                    input.display(),
                    config.scanner.hd_tag
                )
            })?,
    };
    if output.exists() {
        return Err(format!("Output file {} already exists", output.display()).into());
    }

    let task = UpscaleTask::new(input, output, priority);
    let submitter = open_submitter(config).await?;
    match submitter.submit(&task, force).await {
        Ok(id) => {
            println!("{}", id);
            Ok(ExitCode::SUCCESS)
        }
        Err(SubmitError::Conflict(id)) => {
            warn!(id = %id, "Task is already queued; use --force to replace it");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}

async fn scan(config: &Config, root: &Path) -> CliResult {
    let submitter = open_submitter(config).await?;
    let scanner = Arc::new(Scanner::new(ScanRules::from_config(&config.scanner), submitter));
    let summary = scanner.scan(root).await?;

    println!(
        "Submitted {}, already queued {}, failed directories {}",
        summary.submitted, summary.already_queued, summary.failed
    );
    Ok(if summary.failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Parse an exporter address; a bare `:port` listens on every interface.
fn exporter_addr(addr: &str) -> Result<SocketAddr, String> {
    let addr = addr.trim();
    let full = match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => addr.to_string(),
    };
    full.parse()
        .map_err(|e| format!("Invalid metrics exporter address '{}': {}", addr, e))
}

async fn worker(config: &Config, skip_checks: bool, exporter: Option<&str>) -> CliResult {
    if skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
    } else {
        run_startup_checks(config)?;
    }

    let queue = Arc::new(FileQueue::open(&config.queue.state_dir).await?);
    let mut worker = Worker::new(queue, Upscaler::new(config), config);
    info!(
        state_dir = %config.queue.state_dir.display(),
        temp_dir = %config.worker.temp_dir.display(),
        "Worker initialized"
    );

    let shutdown = CancellationToken::new();
    if let Some(addr) = exporter {
        let addr = exporter_addr(addr)?;
        let metrics = new_shared_metrics();
        worker = worker.with_metrics(metrics.clone());
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                    error!("{}", e);
                }
            }
        });
    }

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
                shutdown.cancel();
            }
        }
    });

    let summary = worker.run(shutdown).await;
    info!(
        completed = summary.completed,
        failed = summary.failed,
        "Worker shutdown complete"
    );
    Ok(ExitCode::SUCCESS)
}
