use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use round_runner::config::{parse_resume, RunnerConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Drive novelty detection algorithms through a round-based evaluation
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the run configuration (TOML)
    #[arg(long, short)]
    config: PathBuf,

    /// Log filter (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,

    /// Resume an existing session, as <algorithm>=<session id>
    #[arg(long = "resume", value_parser = parse_resume)]
    resume: Vec<(String, String)>,

    /// Only extract (and save) features
    #[arg(long, default_value_t = false)]
    feature_extraction_only: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Request the test id list and print where it was written
    TestIds,
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| "info".into()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    let mut config = RunnerConfig::from_file(&args.config)
        .context(format!("Failed to load {}", args.config.display()))?;
    config.apply_env();
    config.apply_resume(args.resume);
    if args.feature_extraction_only {
        config.protocol.feature_extraction_only = true;
    }

    if let Some(Command::TestIds) = args.command {
        let path = round_runner::request_test_ids(&config)?;
        println!("{}", path.display());
        return Ok(());
    }

    let (summary, path) = round_runner::execute(&config)?;
    for algorithm in &summary.algorithms {
        info!(
            algorithm = %algorithm.name,
            session_id = %algorithm.session_id,
            tests = algorithm.tests_completed.len(),
            rounds = algorithm.rounds,
            "Algorithm finished"
        );
    }
    info!(summary = %path.display(), "Run complete");
    Ok(())
}
