//! # Regulens CLI (`regulens`)
//!
//! ## Usage
//!
//! ```bash
//! regulens --config ./config/regulens.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `regulens run` | Run (or resume) the audit pipeline |
//! | `regulens status` | Print per-clause assessments from the saved run state |
//!
//! ## Examples
//!
//! ```bash
//! # Generate audit plans, then stop so they can be reviewed
//! regulens run --stop-after audit-plan
//!
//! # Resume, rebuilding the procedure index from scratch
//! regulens run --rebuild-index --progress json
//!
//! # Machine-readable summary
//! regulens status --json
//! ```
//!
//! Ctrl-C stops the run at the next unit boundary; the process exits with
//! status 130 and the saved run state is left as last checkpointed.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use regulens::config::{self, Config};
use regulens::llm::openai::OpenAiModel;
use regulens::pipeline::{Pipeline, RunOptions, RunOutcome, Stage, CANCELLED_MESSAGE};
use regulens::progress::ProgressMode;
use regulens::run_state::RunStateStore;
use regulens::verdict::RunSummary;

/// Exit status for a run stopped by Ctrl-C.
const EXIT_CANCELLED: i32 = 130;

/// Regulens: resumable compliance audits of procedure documents against a
/// regulation.
#[derive(Parser)]
#[command(
    name = "regulens",
    about = "Regulens: resumable compliance audits of procedure documents against a regulation",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/regulens.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline, resuming from the saved run state.
    ///
    /// Units that already have a result are skipped, so this command can be
    /// repeated after an interruption or a partial failure.
    Run {
        /// Stop after this stage completes.
        #[arg(long, value_enum)]
        stop_after: Option<StageArg>,

        /// Rebuild the procedure vector index even if a matching one exists.
        #[arg(long)]
        rebuild_index: bool,

        /// Progress output on stderr. Defaults to `human` on a terminal, `off` otherwise.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Show per-clause assessments and the overall result.
    Status {
        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StageArg {
    NeedCheck,
    AuditPlan,
    Search,
}

impl From<StageArg> for Stage {
    fn from(arg: StageArg) -> Self {
        match arg {
            StageArg::NeedCheck => Stage::NeedCheck,
            StageArg::AuditPlan => Stage::AuditPlan,
            StageArg::Search => Stage::Search,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Human,
    Json,
    Off,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
            ProgressArg::Off => ProgressMode::Off,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            stop_after,
            rebuild_index,
            progress,
        } => {
            let opts = RunOptions {
                stop_after: stop_after.map(Stage::from),
                force_rebuild_index: rebuild_index,
            };
            let mode = progress
                .map(ProgressMode::from)
                .unwrap_or_else(ProgressMode::default_for_tty);
            let outcome = run(&cfg, &opts, mode).await?;
            match outcome {
                RunOutcome::Completed => {
                    print_summary(&cfg, false)?;
                }
                RunOutcome::Stopped(stage) => {
                    println!(
                        "Stopped after {}. Run again to continue.",
                        stage.label()
                    );
                }
                RunOutcome::Cancelled => {
                    eprintln!("{}", CANCELLED_MESSAGE);
                    std::process::exit(EXIT_CANCELLED);
                }
            }
        }
        Commands::Status { json } => {
            print_summary(&cfg, json)?;
        }
    }

    Ok(())
}

async fn run(cfg: &Config, opts: &RunOptions, mode: ProgressMode) -> Result<RunOutcome> {
    let backend = OpenAiModel::new(&cfg.llm)?;
    let reporter = mode.reporter();

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping at next unit");
            flag.store(true, Ordering::SeqCst);
        }
    });
    let cancel = move || interrupted.load(Ordering::SeqCst);

    let pipeline = Pipeline::new(cfg, &backend, &*reporter, &cancel);
    pipeline
        .run(opts)
        .await
        .with_context(|| format!("pipeline failed for project '{}'", cfg.project.name))
}

fn print_summary(cfg: &Config, json: bool) -> Result<()> {
    let store = RunStateStore::new(&cfg.project_dir());
    let state = store
        .load_readonly()
        .with_context(|| format!("failed to read {}", store.path().display()))?;
    let Some(state) = state else {
        if json {
            println!("null");
        } else {
            println!(
                "No run state for project '{}'. Run `regulens run` first.",
                cfg.project.name
            );
        }
        return Ok(());
    };

    let summary = RunSummary::from_run_state(&state);
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Project: {}", summary.project_name);
    for clause in &summary.clauses {
        let evidence = if clause.tasks > 0 {
            format!(
                "  ({}/{} tasks with evidence)",
                clause.tasks_with_evidence, clause.tasks
            )
        } else {
            String::new()
        };
        println!(
            "  {:<10} {:<13} {}{}",
            clause.id, clause.status, clause.title, evidence
        );
    }
    println!("Overall: {}", summary.overall);
    Ok(())
}
