use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};

use harvest::checkpoint::{self, CheckpointStore};
use harvest::convert::{Converter, FileConverter};
use harvest::dedup::ProcessedSet;
use harvest::interrupt::InterruptController;
use harvest::source::JsonlSource;
use harvest::{HarvestConfig, Orchestrator, RunOutcome};

#[derive(Parser)]
#[command(name = "harvest", about = "Resumable, deduplicating record collector")]
struct Cli {
    /// TOML config file (default: ./harvest.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect records from a JSONL stream, resuming the run if it exists
    Collect {
        /// Candidate file, or - for stdin
        #[arg(short, long, default_value = "-")]
        input: PathBuf,
        /// Run name (overrides config)
        #[arg(short, long)]
        run: Option<String>,
        /// Stop after this many new records
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Convert a run's checkpoints to the final formats
    Convert {
        #[arg(short, long)]
        run: Option<String>,
    },
    /// Show checkpoint statistics for a run
    Stats {
        #[arg(short, long)]
        run: Option<String>,
    },
    /// List runs under the output directory
    Runs,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut config = HarvestConfig::load(cli.config.as_deref())?;

    let code = match cli.command {
        Commands::Collect { input, run, limit } => {
            if let Some(run) = run {
                config.run_name = run;
            }
            if limit.is_some() {
                config.max_records = limit;
            }
            config.validate()?;

            let interrupts = InterruptController::new(&config.interrupt);
            interrupts.listen();
            let mut source = JsonlSource::from_arg(&input).await?;
            let mut orchestrator = Orchestrator::new(config, interrupts);
            let summary = orchestrator.run(&mut source).await?;

            println!(
                "Collected {} new records ({} duplicates, {} merged, {} skipped, {} failed candidates)",
                summary.accepted,
                summary.duplicates,
                summary.merged,
                summary.skipped,
                summary.source_failures
            );
            if summary.resumed > 0 {
                println!("Resumed with {} records from earlier checkpoints", summary.resumed);
            }
            println!(
                "Checkpointed {} records in {} batches",
                summary.worker.records, summary.worker.batches
            );
            if summary.worker.dropped_records > 0 {
                println!(
                    "WARNING: {} records in {} batches could not be saved",
                    summary.worker.dropped_records, summary.worker.dropped_batches
                );
            }
            for path in &summary.outputs {
                println!("  {}", path.display());
            }
            if let Some(reason) = &summary.fatal {
                println!("Source stopped early: {}", reason);
            }

            match summary.outcome {
                RunOutcome::Completed => ExitCode::SUCCESS,
                RunOutcome::ForcedShutdown => {
                    println!("Stopped by operator. Progress saved; run again to resume.");
                    ExitCode::from(1)
                }
            }
        }
        Commands::Convert { run } => {
            let run = run.unwrap_or_else(|| config.run_name.clone());
            let store = CheckpointStore::open(&config.checkpoint_root(), &run, ProcessedSet::new())?;
            let records = store.latest_snapshot()?;
            if records.is_empty() {
                println!("No checkpoints for run '{}'.", run);
                return Ok(ExitCode::SUCCESS);
            }
            println!("Loaded {} records from checkpoints", records.len());
            let converter = FileConverter::new(config.final_dir(), &config.convert);
            let paths = converter
                .convert(&records, &run)
                .with_context(|| format!("converting run '{}'", run))?;
            for path in paths {
                println!("  {}", path.display());
            }
            ExitCode::SUCCESS
        }
        Commands::Stats { run } => {
            let run = run.unwrap_or_else(|| config.run_name.clone());
            let dir = config.checkpoint_root().join(&run);
            let s = checkpoint::scan_dir(&dir)?.stats();
            println!("Run:           {}", run);
            println!("Files:         {}", s.files);
            println!("Records:       {}", s.records);
            println!("Unique:        {}", s.unique);
            println!("Corrupt lines: {}", s.corrupt_lines);
            ExitCode::SUCCESS
        }
        Commands::Runs => {
            let runs = checkpoint::list_runs(&config.checkpoint_root())?;
            if runs.is_empty() {
                println!("No runs under {}.", config.checkpoint_root().display());
            }
            for run in runs {
                let files = checkpoint::checkpoint_files(&config.checkpoint_root().join(&run))?;
                println!("{:<32} {:>5} files", truncate(&run, 32), files.len());
            }
            ExitCode::SUCCESS
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    Ok(code)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
