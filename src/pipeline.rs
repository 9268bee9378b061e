use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Serialize;

use crate::error::{PipelineError, Result};
use crate::evaluator::Evaluator;
use crate::grid::{self, GenerationPlan, GridAxes};
use crate::meta::RunMeta;
use crate::package::{self, CommitGateVerdict, GateStatus, PackRequest};
use crate::scm::StatusProvider;
use crate::selection::{self, SelectionOutcome, ThresholdLevel};
use crate::validation::{self, StrictCriteria, ValidationOutcome};

/// Everything the orchestrator needs, resolved from the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub base_grid: PathBuf,
    pub aug_grid: Option<PathBuf>,
    pub splits: Vec<u32>,
    pub validation_splits: Vec<u32>,
    pub wf_command: Option<Vec<String>>,
    pub n_min: usize,
    pub trades_min: u64,
    pub levels: Vec<ThresholdLevel>,
    pub strict: StrictCriteria,
    pub max_combinations: usize,
    pub seed: u64,
    pub out_dir: PathBuf,
    pub ts: String,
    pub dry_run: bool,
    pub pack: bool,
    pub equity_start: Option<NaiveDate>,
    pub equity_end: Option<NaiveDate>,
}

#[derive(Debug)]
pub struct RunReport {
    pub meta: RunMeta,
    pub success: bool,
}

struct RunPaths {
    raw: PathBuf,
    summary: PathBuf,
    select_json: PathBuf,
    select_log: PathBuf,
    validation_raw: PathBuf,
    validation_summary: PathBuf,
    validation_json: PathBuf,
    final_csv: PathBuf,
    run_meta: PathBuf,
}

impl RunPaths {
    fn new(out_dir: &Path, ts: &str) -> Self {
        RunPaths {
            raw: out_dir.join(format!("wf_stability_{}.csv", ts)),
            summary: out_dir.join(format!("wf_stability_summary_{}.csv", ts)),
            select_json: out_dir.join(format!("select_candidates_{}.json", ts)),
            select_log: out_dir.join(format!("select_candidates_{}.log", ts)),
            validation_raw: out_dir.join(format!("wf_validation_{}.csv", ts)),
            validation_summary: out_dir.join(format!("wf_validation_summary_{}.csv", ts)),
            validation_json: out_dir.join(format!("wf_validation_{}.json", ts)),
            final_csv: out_dir.join(format!("final_candidates_{}.csv", ts)),
            run_meta: out_dir.join(format!("run_meta_{}.json", ts)),
        }
    }
}

/// Drives the full run: base generation, selection with the augmentation
/// loop, out-of-sample validation, then packaging behind the commit gate.
/// The cumulative metadata record persists after every stage, so whatever
/// already ran survives a later failure.
pub fn run(
    config: &RunConfig,
    evaluator: Option<&dyn Evaluator>,
    scm: &dyn StatusProvider,
) -> Result<RunReport> {
    let paths = RunPaths::new(&config.out_dir, &config.ts);
    fs::create_dir_all(&config.out_dir)?;

    let mut meta = RunMeta::new(&config.ts, serde_json::to_value(config)?);
    meta.git = Some(scm.status());
    meta.commit_gate = Some(if config.pack {
        CommitGateVerdict::skipped()
    } else {
        CommitGateVerdict::not_requested()
    });
    meta.add_artifact(paths.run_meta.display().to_string());
    meta.persist(&paths.run_meta)?;

    let base_spec = grid::load_grid_spec(&config.base_grid)?;
    let base_axes = GridAxes::from_spec(&base_spec)?;
    let aug = match &config.aug_grid {
        Some(path) => Some(grid::load_augmentation_spec(path)?),
        None => None,
    };

    if !config.dry_run && evaluator.is_none() {
        return Err(PipelineError::Input(
            "an evaluator command is required unless --dry-run is set".into(),
        ));
    }

    tracing::info!("run {}: base generation", config.ts);
    let mut evaluated = HashSet::new();
    // The base grid always runs in full; the cap only bounds augment passes.
    let base_plan = GenerationPlan {
        stage: None,
        splits: &config.splits,
        raw_path: &paths.raw,
        summary_path: &paths.summary,
        max_combinations: None,
        seed: config.seed,
        dry_run: config.dry_run,
    };
    let outcome = grid::run_generation(&base_axes, &base_plan, &mut evaluated, evaluator)?;
    meta.generation.push(outcome);
    if !config.dry_run {
        // Disk is the source of truth for what has been summarized.
        evaluated = grid::load_existing_fingerprints(&paths.summary)?;
        meta.add_artifact(paths.raw.display().to_string());
        meta.add_artifact(paths.summary.display().to_string());
    }
    meta.persist(&paths.run_meta)?;

    if config.dry_run {
        return finish_dry_run(config, &paths, meta, &base_axes, aug.as_ref(), evaluated);
    }

    tracing::info!("run {}: selection", config.ts);
    let mut selection = run_selection(config, &paths, &mut meta)?;

    // Augmentation loop: widen the grid one cumulative stage at a time
    // until the quota is met or the stages run out.
    if let Some(aug) = &aug {
        let mut stage_n = 1;
        while !selection.quota_met() && stage_n <= aug.stages.len() {
            let stage_name = aug.stages[stage_n - 1].name.clone();
            tracing::info!("run {}: augmentation stage {}", config.ts, stage_name);
            let staged_axes = base_axes.with_stages(aug, stage_n)?;
            let plan = GenerationPlan {
                stage: Some(stage_name),
                splits: &config.splits,
                raw_path: &paths.raw,
                summary_path: &paths.summary,
                max_combinations: Some(config.max_combinations),
                seed: config.seed,
                dry_run: false,
            };
            let outcome = grid::run_generation(&staged_axes, &plan, &mut evaluated, evaluator)?;
            meta.generation.push(outcome);
            meta.persist(&paths.run_meta)?;

            selection = run_selection(config, &paths, &mut meta)?;
            stage_n += 1;
        }
    }

    tracing::info!("run {}: validation", config.ts);
    let validation_outcome = if selection.quota_met() {
        let evaluator = evaluator.ok_or_else(|| {
            PipelineError::Input("an evaluator command is required unless --dry-run is set".into())
        })?;
        let outcome = validation::run_validation(
            &selection.selected,
            &config.validation_splits,
            config.strict,
            config.trades_min,
            &paths.validation_raw,
            &paths.validation_summary,
            &paths.final_csv,
            evaluator,
        )?;
        meta.add_artifact(paths.validation_raw.display().to_string());
        meta.add_artifact(paths.validation_summary.display().to_string());
        meta.add_artifact(paths.final_csv.display().to_string());
        outcome
    } else {
        let reason = match selection.blocking_condition {
            Some(r) => format!(
                "selection quota unmet ({} of {}), blocking condition: {}",
                selection.selected.len(),
                config.n_min,
                r.label()
            ),
            None => format!(
                "selection quota unmet ({} of {})",
                selection.selected.len(),
                config.n_min
            ),
        };
        tracing::warn!("validation skipped: {}", reason);
        ValidationOutcome::skipped(reason)
    };
    fs::write(
        &paths.validation_json,
        serde_json::to_string_pretty(&validation_outcome)?,
    )?;
    meta.add_artifact(paths.validation_json.display().to_string());
    meta.validation = Some(validation_outcome);
    meta.persist(&paths.run_meta)?;

    let mut success = true;
    if config.pack {
        let verdict = run_pack_stage(config, &mut meta, scm)?;
        success = verdict.status != GateStatus::Failed;
        meta.commit_gate = Some(verdict);
        meta.persist(&paths.run_meta)?;
    }

    Ok(RunReport { meta, success })
}

/// Dry-run tail: count every augmentation stage, then record why the later
/// stages did not run. Requesting a pack from a dry run is a hard gate
/// failure so automation cannot mistake the rehearsal for a release.
fn finish_dry_run(
    config: &RunConfig,
    paths: &RunPaths,
    mut meta: RunMeta,
    base_axes: &GridAxes,
    aug: Option<&grid::AugmentationSpec>,
    mut evaluated: HashSet<String>,
) -> Result<RunReport> {
    if let Some(aug) = aug {
        for stage_n in 1..=aug.stages.len() {
            let staged_axes = base_axes.with_stages(aug, stage_n)?;
            let plan = GenerationPlan {
                stage: Some(aug.stages[stage_n - 1].name.clone()),
                splits: &config.splits,
                raw_path: &paths.raw,
                summary_path: &paths.summary,
                max_combinations: Some(config.max_combinations),
                seed: config.seed,
                dry_run: true,
            };
            let outcome = grid::run_generation(&staged_axes, &plan, &mut evaluated, None)?;
            meta.generation.push(outcome);
        }
    }
    meta.validation = Some(ValidationOutcome::skipped("dry run".to_string()));

    let mut success = true;
    if config.pack {
        let verdict =
            CommitGateVerdict::failed("packaging requires a live run; dry-run is active");
        success = false;
        meta.commit_gate = Some(verdict);
    }
    meta.persist(&paths.run_meta)?;
    Ok(RunReport { meta, success })
}

fn run_selection(
    config: &RunConfig,
    paths: &RunPaths,
    meta: &mut RunMeta,
) -> Result<SelectionOutcome> {
    let records = grid::load_summary_records(&paths.summary)?;
    let outcome = selection::select(&records, &config.levels, config.n_min, config.trades_min);
    for line in outcome.log_lines() {
        tracing::info!("{}", line);
    }
    fs::write(&paths.select_json, serde_json::to_string_pretty(&outcome)?)?;
    fs::write(&paths.select_log, outcome.log_lines().join("\n") + "\n")?;
    meta.add_artifact(paths.select_json.display().to_string());
    meta.add_artifact(paths.select_log.display().to_string());
    meta.selection = Some(outcome.clone());
    meta.persist(&paths.run_meta)?;
    Ok(outcome)
}

fn run_pack_stage(
    config: &RunConfig,
    meta: &mut RunMeta,
    scm: &dyn StatusProvider,
) -> Result<CommitGateVerdict> {
    let (Some(equity_start), Some(equity_end)) = (config.equity_start, config.equity_end) else {
        return Ok(CommitGateVerdict::failed(
            "packaging requires --equity-start and --equity-end",
        ));
    };
    let survivors = meta
        .validation
        .as_ref()
        .map(|v| v.survivors.clone())
        .unwrap_or_default();
    if survivors.is_empty() {
        return Ok(CommitGateVerdict::failed("No candidates met thresholds."));
    }

    let verdict = package::compute_commit_gate(scm);
    if verdict.status == GateStatus::Failed {
        tracing::warn!("commit gate failed: {}", verdict.reason);
        return Ok(verdict);
    }

    let commit = verdict
        .scm
        .as_ref()
        .and_then(|s| s.commit.clone());
    let request = PackRequest {
        out_dir: &config.out_dir,
        ts: &config.ts,
        equity_start,
        equity_end,
        strict: config.strict,
        n_min: config.n_min,
        trades_min: config.trades_min,
        base_grid: &config.base_grid,
        aug_grid: config.aug_grid.as_deref(),
        survivors: &survivors,
        commit: commit.as_deref(),
        artifacts: &meta.artifacts,
        repro_command: repro_command(config),
    };
    let info = package::create_results_pack(&request)?;
    meta.add_artifact(info.readme.clone());
    meta.add_artifact(info.zip.clone());
    meta.pack = Some(info);
    Ok(verdict)
}

fn repro_command(config: &RunConfig) -> String {
    let join = |v: &[u32]| {
        v.iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(",")
    };
    let mut cmd = format!(
        "stability-runner --base-grid {} --splits {} --validation-splits {} \
--n-min {} --trades-min {} --max-combinations {} --seed {} --out {} --ts {}",
        config.base_grid.display(),
        join(&config.splits),
        join(&config.validation_splits),
        config.n_min,
        config.trades_min,
        config.max_combinations,
        config.seed,
        config.out_dir.display(),
        config.ts
    );
    if let Some(aug) = &config.aug_grid {
        cmd.push_str(&format!(" --aug-grid {}", aug.display()));
    }
    if let Some(wf) = &config.wf_command {
        cmd.push_str(&format!(" --wf-command \"{}\"", wf.join(" ")));
    }
    if let (Some(start), Some(end)) = (config.equity_start, config.equity_end) {
        cmd.push_str(&format!(
            " --pack --equity-start {} --equity-end {}",
            start, end
        ));
    }
    cmd
}
