//! testsmith CLI - Main Entry Point

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;

use testsmith::artifacts::{ArtifactStore, RunStatus, RunSummary};
use testsmith::config::{load_dotenv, PipelineConfig};
use testsmith::pipeline::{
    ExistingCode, PipelineCoordinator, PipelineRuntime, RunOptions, RunReport, RunScheduler,
};

/// Turn natural-language test specifications into verified Playwright tests
#[derive(Parser)]
#[command(name = "testsmith")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file (default: ./testsmith.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one specification through the pipeline
    Run {
        spec: PathBuf,

        /// Try this previously generated test before regenerating
        #[arg(long, value_name = "PATH", conflicts_with = "reuse")]
        try_code: Option<PathBuf>,

        /// Look for previously generated code matching the specification
        #[arg(long)]
        reuse: bool,

        /// Validation attempt budget
        #[arg(long, value_name = "N")]
        max_attempts: Option<u32>,
    },

    /// Run several specifications concurrently
    Batch {
        #[arg(required = true)]
        specs: Vec<PathBuf>,

        /// Look for previously generated code matching each specification
        #[arg(long)]
        reuse: bool,
    },

    /// List runs, or show one run
    Status { run_id: Option<String> },

    /// Delete runs older than the retention period
    Prune,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Secrets referenced by plans may live in .env
    load_dotenv();

    let log_level = if cli.verbose { "testsmith=debug,info" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = PipelineConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Run {
            spec,
            try_code,
            reuse,
            max_attempts,
        } => {
            let mut options = RunOptions::default();
            if let Some(path) = try_code {
                options = options.with_existing_code(ExistingCode::Path(path));
            } else if reuse {
                options = options.with_existing_code(ExistingCode::Auto);
            }
            if let Some(n) = max_attempts {
                options = options.with_max_attempts(n);
            }

            let coordinator = coordinator(config)?;
            let report = coordinator
                .run(&spec, options)
                .await
                .with_context(|| format!("running {}", spec.display()))?;
            print_report(&report);
            Ok(exit_code(report.passed()))
        }
        Commands::Batch { specs, reuse } => {
            let scheduler = RunScheduler::new(coordinator(config)?);
            let mut options = RunOptions::default();
            if reuse {
                options = options.with_existing_code(ExistingCode::Auto);
            }

            let mut tickets = Vec::new();
            for spec in &specs {
                let ticket = scheduler
                    .submit(spec, options.clone())
                    .with_context(|| format!("scheduling {}", spec.display()))?;
                println!("{} {} {}", "scheduled".cyan(), ticket.run_id, spec.display());
                tickets.push(ticket);
            }

            let mut all_passed = true;
            println!();
            for result in RunScheduler::wait_all(tickets).await {
                let report = result.context("run task panicked")?;
                all_passed &= report.passed();
                print_report(&report);
            }
            Ok(exit_code(all_passed))
        }
        Commands::Status { run_id } => {
            let store = ArtifactStore::new(&config.runs_dir, config.retention_days)?;
            match run_id {
                Some(run_id) => {
                    let summary = store.summary(&run_id)?;
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                }
                None => print_runs(&store.list_runs()?),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Prune => {
            let store = ArtifactStore::new(&config.runs_dir, config.retention_days)?;
            let deleted = store.enforce_retention()?;
            println!("Pruned {deleted} run(s) older than {} day(s)", config.retention_days);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn coordinator(config: PipelineConfig) -> anyhow::Result<PipelineCoordinator> {
    let runtime = PipelineRuntime::from_config(config).context("preparing runs directory")?;
    Ok(PipelineCoordinator::new(Arc::new(runtime)))
}

fn exit_code(passed: bool) -> ExitCode {
    if passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn status_label(status: RunStatus) -> String {
    match status {
        RunStatus::Passed => status.as_str().green().to_string(),
        RunStatus::Failed => status.as_str().red().to_string(),
        RunStatus::InProgress => status.as_str().yellow().to_string(),
        RunStatus::Pending => status.as_str().dimmed().to_string(),
    }
}

fn print_report(report: &RunReport) {
    println!("{} {}", report.run_id.bold(), status_label(report.status));
    if let Some(validation) = &report.validation {
        println!("  {} ({} attempt(s))", validation.message, validation.attempts);
        println!("  test: {}", validation.test_file);
    }
    if let Some(failure) = &report.failure {
        println!("  {} [{}] {}", "error".red(), failure.stage, failure.message);
    }
    println!("  artifacts: {}", report.dir.display());
}

fn print_runs(runs: &[RunSummary]) {
    if runs.is_empty() {
        println!("No runs found");
        return;
    }
    println!(
        "{:<40} {:<12} {:>5} {:>7}  {}",
        "RUN", "STATUS", "STEPS", "FAILED", "TEST"
    );
    for run in runs {
        let mut test = run.test_name.clone().unwrap_or_else(|| "-".to_string());
        if run.reused {
            test.push_str(" (reused)");
        }
        println!(
            "{:<40} {:<12} {:>5} {:>7}  {}",
            run.run_id,
            run.status.as_str(),
            run.steps,
            run.failed_steps,
            test
        );
    }
}
