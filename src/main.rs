use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDate};
use clap::Parser;

use stability_runner::evaluator::{Evaluator, SubprocessEvaluator};
use stability_runner::logging::setup_logging;
use stability_runner::pipeline::{self, RunConfig};
use stability_runner::scm::GitStatusProvider;
use stability_runner::selection::parse_levels;
use stability_runner::validation::StrictCriteria;
use stability_runner::{grid, package};

/// Staged walk-forward calibration: generate a parameter grid, evaluate it
/// over stability splits, select candidates through widening thresholds,
/// validate survivors out of sample, and gate packaging on a clean tree.
#[derive(Parser, Debug)]
#[command(name = "stability-runner")]
struct Args {
    /// Base grid spec (JSON)
    #[arg(long)]
    base_grid: PathBuf,

    /// Augmentation grid spec (JSON), applied stage by stage while the
    /// candidate quota is unmet
    #[arg(long)]
    aug_grid: Option<PathBuf>,

    /// Stability split identifiers, comma separated
    #[arg(long, default_value = "20,30")]
    splits: String,

    /// Held-out validation split identifiers, comma separated
    #[arg(long, default_value = "40,60")]
    validation_splits: String,

    /// Evaluator command line; parameters arrive as environment variables
    #[arg(long)]
    wf_command: Option<String>,

    /// Candidate quota
    #[arg(long, default_value_t = 5)]
    n_min: usize,

    /// Minimum trade count per split
    #[arg(long, default_value_t = 30)]
    trades_min: u64,

    /// Widening levels as pf_min,ret_min,dd_max triples separated by ';'
    #[arg(long, default_value = "1.05,0,20;1.02,-0.05,22;1.00,-0.10,25")]
    levels: String,

    #[arg(long, default_value_t = 1.05)]
    strict_pf_min: f64,

    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    strict_ret_min: f64,

    #[arg(long, default_value_t = 20.0)]
    strict_dd_max: f64,

    #[arg(long, default_value_t = -0.10, allow_hyphen_values = true)]
    strict_pf_drift: f64,

    /// Cap on combinations scheduled per augmentation pass; the base grid
    /// always evaluates in full
    #[arg(long, default_value_t = 2000)]
    max_combinations: usize,

    /// Seed for the cap subsample
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Output directory for all run artifacts
    #[arg(long, default_value = "results")]
    out: PathBuf,

    /// Run tag; defaults to the current local time
    #[arg(long)]
    ts: Option<String>,

    /// Also write the log to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[arg(long)]
    verbose: bool,

    /// Combinatorics only: count and dedupe, evaluate nothing
    #[arg(long)]
    dry_run: bool,

    /// Build the results pack and run the commit gate
    #[arg(long)]
    pack: bool,

    /// Equity window start (YYYY-MM-DD), required with --pack
    #[arg(long)]
    equity_start: Option<NaiveDate>,

    /// Equity window end (YYYY-MM-DD), required with --pack
    #[arg(long)]
    equity_end: Option<NaiveDate>,
}

fn parse_split_list(text: &str, what: &str) -> Result<Vec<u32>> {
    let splits: Vec<u32> = text
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>().with_context(|| format!("bad {} value {:?}", what, s)))
        .collect::<Result<_>>()?;
    if splits.is_empty() {
        bail!("{} must name at least one split", what);
    }
    Ok(splits)
}

fn run_cli() -> Result<bool> {
    let args = Args::parse();
    let guard = setup_logging(args.verbose, args.log_file.as_deref())?;

    if args.pack && (args.equity_start.is_none() || args.equity_end.is_none()) {
        // A packaging precondition, not an input error: the run still
        // executes and records a failed commit-gate verdict in its metadata.
        tracing::warn!("--pack without both --equity-start and --equity-end; the commit gate will fail");
    }
    if !args.dry_run && args.wf_command.is_none() {
        bail!("--wf-command is required unless --dry-run is set");
    }

    let wf_command: Option<Vec<String>> = args
        .wf_command
        .as_ref()
        .map(|cmd| cmd.split_whitespace().map(String::from).collect());

    let config = RunConfig {
        base_grid: args.base_grid.clone(),
        aug_grid: args.aug_grid.clone(),
        splits: parse_split_list(&args.splits, "--splits")?,
        validation_splits: parse_split_list(&args.validation_splits, "--validation-splits")?,
        wf_command: wf_command.clone(),
        n_min: args.n_min,
        trades_min: args.trades_min,
        levels: parse_levels(&args.levels)?,
        strict: StrictCriteria {
            pf_min: args.strict_pf_min,
            ret_min: args.strict_ret_min,
            dd_max: args.strict_dd_max,
            pf_drift_min: args.strict_pf_drift,
        },
        max_combinations: args.max_combinations,
        seed: args.seed,
        out_dir: args.out.clone(),
        ts: args
            .ts
            .clone()
            .unwrap_or_else(|| Local::now().format("%Y%m%d_%H%M%S").to_string()),
        dry_run: args.dry_run,
        pack: args.pack,
        equity_start: args.equity_start,
        equity_end: args.equity_end,
    };

    // The evaluator needs the shared environment from the grid spec.
    let evaluator: Option<SubprocessEvaluator> = match wf_command {
        Some(command) => {
            let spec = grid::load_grid_spec(&config.base_grid)?;
            Some(SubprocessEvaluator::new(command, spec.base_env))
        }
        None => None,
    };

    let scm = GitStatusProvider::new(".");
    let report = pipeline::run(
        &config,
        evaluator.as_ref().map(|e| e as &dyn Evaluator),
        &scm,
    )?;

    if let Some(gate) = &report.meta.commit_gate {
        if gate.status == package::GateStatus::Failed {
            tracing::error!("commit gate failed: {}", gate.reason);
        } else {
            tracing::info!("commit gate: {:?} ({})", gate.status, gate.reason);
        }
    }
    tracing::info!(
        "run {} finished; metadata in {}/run_meta_{}.json",
        config.ts,
        config.out_dir.display(),
        config.ts
    );

    drop(guard);
    Ok(report.success)
}

fn main() {
    match run_cli() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("error: {:#}", err);
            std::process::exit(1);
        }
    }
}
