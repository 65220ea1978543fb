//! CLI entry point for the CivitAI downloader.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use civitai_core::bulk::{JobProgress, JobReport, ProgressCallback, parse_search_results};
use civitai_core::optimizer::ProcfsSampler;
use civitai_core::{
    AnalyticsSink, BasicScanner, BulkDownloadManager, BulkStatus, Config, ErrorHandler, HttpTransfer, JobOptions,
    PerformanceOptimizer, SqliteAnalytics,
};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

mod cli;

use cli::{Args, Command, DownloadArgs};

const API_TOKEN_ENV: &str = "CIVITAI_API_TOKEN";

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading config {}", path.display()))?,
        None => Config::load_default().context("loading default config")?,
    };
    if config.transfer.api_token.is_none() {
        config.transfer.api_token = std::env::var(API_TOKEN_ENV).ok().filter(|token| !token.is_empty());
    }

    match args.command {
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Download(download) => {
            let completed = run_download(download, config, args.analytics_db.as_deref(), args.quiet).await?;
            Ok(if completed { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
    }
}

/// Runs one bulk job and prints its report. Returns true when it completed.
async fn run_download(
    download: DownloadArgs,
    mut config: Config,
    analytics_db: Option<&Path>,
    quiet: bool,
) -> Result<bool> {
    if let Some(strategy) = download.strategy {
        config.bulk.strategy = strategy;
    }
    if let Some(concurrency) = download.concurrency {
        config.bulk.max_concurrent = usize::from(concurrency);
    }
    if let Some(mode) = download.mode {
        config.optimizer.mode = mode;
    }
    config.validate().context("invalid configuration")?;

    let raw = tokio::fs::read_to_string(&download.results)
        .await
        .with_context(|| format!("reading {}", download.results.display()))?;
    let results = parse_search_results(&raw)
        .with_context(|| format!("parsing search results in {}", download.results.display()))?;

    let optimizer = Arc::new(PerformanceOptimizer::new(config.optimizer.clone()));
    let monitor = optimizer.start_monitoring(Arc::new(ProcfsSampler::default()));

    let analytics: Option<Arc<dyn AnalyticsSink>> = match analytics_db {
        Some(path) => {
            let sink = SqliteAnalytics::new(path)
                .await
                .with_context(|| format!("opening analytics database {}", path.display()))?;
            Some(Arc::new(sink) as Arc<dyn AnalyticsSink>)
        }
        None => None,
    };

    let mut handler = ErrorHandler::new(&config.retry, &config.metrics).with_optimizer(Arc::clone(&optimizer));
    if let Some(sink) = &analytics {
        handler = handler.with_analytics(Arc::clone(sink));
    }
    let handler = Arc::new(handler);

    let transfer = HttpTransfer::new(config.transfer.clone())
        .context("building HTTP client")?
        .with_optimizer(Arc::clone(&optimizer));

    let manager = BulkDownloadManager::new(
        Arc::clone(&handler),
        Arc::new(transfer),
        Arc::new(BasicScanner::new(download.strict_scan)),
        config.bulk.clone(),
    )
    .with_output_dir(&download.output_dir);

    let name = download.name.clone().unwrap_or_else(|| {
        download
            .results
            .file_stem()
            .map_or_else(|| "bulk download".to_string(), |stem| stem.to_string_lossy().into_owned())
    });
    let options = JobOptions {
        latest_version_only: download.latest_only,
        primary_only: download.primary_only,
        output_dir: Some(download.output_dir.clone()),
        ..JobOptions::default()
    };
    let job_id = manager.create_job(results, name, options);

    let bar = progress_bar(quiet);
    let on_progress: ProgressCallback = {
        let bar = bar.clone();
        Arc::new(move |_job_id: &str, progress: &JobProgress| {
            bar.set_length(progress.total_files as u64);
            bar.set_position((progress.downloaded_files + progress.failed_files) as u64);
            bar.set_message(format!("{} ok, {} failed", progress.downloaded_files, progress.failed_files));
        })
    };
    manager.subscribe_progress(Arc::clone(&on_progress));

    let status = tokio::select! {
        result = manager.process_job(&job_id) => result?.status,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling job");
            manager.cancel_job(&job_id).await;
            BulkStatus::Cancelled
        }
    };

    manager.unsubscribe_progress(&on_progress);
    bar.finish_and_clear();
    monitor.stop().await;

    info!(status = %status, "download finished");
    if let Some(report) = manager.export_job_report(&job_id).await {
        if let Some(sink) = &analytics {
            record_job_metrics(sink.as_ref(), &report).await;
        }
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    debug!(report = ?handler.performance_report(), "retry metrics");

    Ok(status == BulkStatus::Completed)
}

/// Stores job totals as metric samples tagged with the job name and status.
async fn record_job_metrics(sink: &dyn AnalyticsSink, report: &JobReport) {
    let tags = BTreeMap::from([
        ("job".to_string(), report.name.clone()),
        ("status".to_string(), report.status.to_string()),
    ]);
    #[allow(clippy::cast_precision_loss)]
    let samples = [
        ("bulk.downloaded_files", report.downloaded_files as f64),
        ("bulk.failed_files", report.failed_files as f64),
        ("bulk.total_bytes", report.total_size_bytes as f64),
        ("bulk.duration_secs", report.duration_secs.unwrap_or(0.0)),
    ];
    for (name, value) in samples {
        if let Err(error) = sink.record_metric(name, value, &tags).await {
            warn!(%error, metric = name, "could not store job metric");
        }
    }
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} files {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar
}
