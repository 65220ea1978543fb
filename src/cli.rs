//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use civitai_core::OptimizationMode;
use civitai_core::bulk::BatchStrategy;
use clap::{Args as ClapArgs, Parser, Subcommand};

/// Bulk download CivitAI models with adaptive retries and throughput tuning.
#[derive(Parser, Debug)]
#[command(name = "civitai-dl")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/civitai-downloader/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Record API responses and errors in this SQLite database
    #[arg(long, global = true, value_name = "PATH")]
    pub analytics_db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download every file referenced by a saved search response
    Download(DownloadArgs),

    /// Print the effective configuration as TOML
    Config,
}

#[derive(ClapArgs, Debug)]
pub struct DownloadArgs {
    /// JSON file with model search results (array or `{"items": [...]}`)
    #[arg(value_name = "RESULTS_JSON")]
    pub results: PathBuf,

    /// Download root directory
    #[arg(short, long, default_value = "downloads")]
    pub output_dir: PathBuf,

    /// Job name shown in reports (default: the results file name)
    #[arg(long)]
    pub name: Option<String>,

    /// Only the newest version of each model
    #[arg(long)]
    pub latest_only: bool,

    /// Only files marked as primary
    #[arg(long)]
    pub primary_only: bool,

    /// Batch strategy: sequential, parallel or adaptive
    #[arg(long)]
    pub strategy: Option<BatchStrategy>,

    /// Concurrent transfers for the parallel strategy (1-100)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: Option<u8>,

    /// Optimizer mode: speed, efficiency, minimal or adaptive
    #[arg(long)]
    pub mode: Option<OptimizationMode>,

    /// Treat pickle-based formats as suspicious
    #[arg(long)]
    pub strict_scan: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_download_parses_defaults() {
        let args = Args::try_parse_from(["civitai-dl", "download", "results.json"]).unwrap();
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        let Command::Download(download) = args.command else {
            panic!("expected download command");
        };
        assert_eq!(download.results, PathBuf::from("results.json"));
        assert_eq!(download.output_dir, PathBuf::from("downloads"));
        assert!(download.strategy.is_none());
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let args = Args::try_parse_from(["civitai-dl", "download", "r.json", "-vv", "--config", "c.toml"]).unwrap();
        assert_eq!(args.verbose, 2);
        assert_eq!(args.config, Some(PathBuf::from("c.toml")));
    }

    #[test]
    fn test_cli_strategy_and_mode_values() {
        let args = Args::try_parse_from([
            "civitai-dl",
            "download",
            "r.json",
            "--strategy",
            "sequential",
            "--mode",
            "minimal",
        ])
        .unwrap();
        let Command::Download(download) = args.command else {
            panic!("expected download command");
        };
        assert_eq!(download.strategy, Some(BatchStrategy::Sequential));
        assert_eq!(download.mode, Some(OptimizationMode::Minimal));

        let result = Args::try_parse_from(["civitai-dl", "download", "r.json", "--strategy", "bogus"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_concurrency_range() {
        let result = Args::try_parse_from(["civitai-dl", "download", "r.json", "-c", "0"]);
        assert!(result.is_err());
        let args = Args::try_parse_from(["civitai-dl", "download", "r.json", "-c", "100"]).unwrap();
        let Command::Download(download) = args.command else {
            panic!("expected download command");
        };
        assert_eq!(download.concurrency, Some(100));
    }

    #[test]
    fn test_cli_requires_subcommand() {
        let result = Args::try_parse_from(["civitai-dl"]);
        assert!(result.is_err());
    }
}
