use std::fs;
use std::path::Path;

use chrono::NaiveDate;

use stability_runner::error::Result;
use stability_runner::evaluator::{Evaluator, SplitEvaluation};
use stability_runner::grid::ParameterCombination;
use stability_runner::package::GateStatus;
use stability_runner::pipeline::{self, RunConfig};
use stability_runner::scm::{SourceControlStatus, StatusProvider};
use stability_runner::selection::parse_levels;
use stability_runner::validation::StrictCriteria;

struct CleanScm;

impl StatusProvider for CleanScm {
    fn status(&self) -> SourceControlStatus {
        SourceControlStatus {
            commit: Some("abc1234".to_string()),
            branch: Some("main".to_string()),
            dirty: Some(false),
            changed: 0,
            changed_sample: Vec::new(),
            available: true,
        }
    }
}

struct DirtyScm;

impl StatusProvider for DirtyScm {
    fn status(&self) -> SourceControlStatus {
        SourceControlStatus {
            commit: Some("abc1234".to_string()),
            branch: Some("main".to_string()),
            dirty: Some(true),
            changed: 3,
            changed_sample: vec!["src/strategy.rs".to_string(), "grids/base.json".to_string()],
            available: true,
        }
    }
}

/// Fixed healthy metrics for every combination and split.
struct HealthyEvaluator;

impl Evaluator for HealthyEvaluator {
    fn evaluate(&self, _combo: &ParameterCombination, split: u32) -> Result<SplitEvaluation> {
        Ok(SplitEvaluation {
            split,
            trades: 50,
            profit_factor: 1.2,
            return_pct: 3.0,
            max_drawdown_pct: 10.0,
        })
    }
}

/// Profit factor below every widening level, so nothing ever selects.
struct HopelessEvaluator;

impl Evaluator for HopelessEvaluator {
    fn evaluate(&self, _combo: &ParameterCombination, split: u32) -> Result<SplitEvaluation> {
        Ok(SplitEvaluation {
            split,
            trades: 50,
            profit_factor: 0.8,
            return_pct: -1.0,
            max_drawdown_pct: 10.0,
        })
    }
}

fn write_grids(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let base = dir.join("base_grid.json");
    fs::write(
        &base,
        r#"{
          "parameters": {
            "OB_KTP": {"kind": "values", "values": [1, 2]}
          },
          "base_env": {"OB_MAXDD_STOP": "20"}
        }"#,
    )
    .unwrap();
    let aug = dir.join("aug_grid.json");
    fs::write(
        &aug,
        r#"{"stages": [
          {"name": "widen_ktp", "adjustments": {
            "OB_KTP": {"action": "add_values", "values": [3, 4, 5, 6]}}}
        ]}"#,
    )
    .unwrap();
    (base, aug)
}

fn config(dir: &Path, base: &Path, aug: Option<&Path>) -> RunConfig {
    RunConfig {
        base_grid: base.to_path_buf(),
        aug_grid: aug.map(Path::to_path_buf),
        splits: vec![20, 30],
        validation_splits: vec![40, 60],
        wf_command: None,
        n_min: 5,
        trades_min: 30,
        levels: parse_levels("1.05,0,20;1.02,-0.05,22;1.00,-0.10,25").unwrap(),
        strict: StrictCriteria::default(),
        max_combinations: 2000,
        seed: 42,
        out_dir: dir.join("results"),
        ts: "t1".to_string(),
        dry_run: false,
        pack: false,
        equity_start: None,
        equity_end: None,
    }
}

#[test]
fn dry_run_counts_all_stages_and_skips_everything_else() {
    let dir = tempfile::tempdir().unwrap();
    let (base, aug) = write_grids(dir.path());
    let mut cfg = config(dir.path(), &base, Some(&aug));
    cfg.dry_run = true;

    let report = pipeline::run(&cfg, None, &CleanScm).unwrap();
    assert!(report.success);

    // Base pass plus one augmentation stage, counted without evaluation.
    assert_eq!(report.meta.generation.len(), 2);
    assert_eq!(report.meta.generation[0].combos_total, 2);
    assert_eq!(report.meta.generation[0].combos_evaluated, 0);
    assert_eq!(report.meta.generation[1].combos_total, 6);
    assert_eq!(report.meta.generation[1].duplicates_skipped, 2);

    let validation = report.meta.validation.as_ref().unwrap();
    assert!(validation.skipped);
    assert_eq!(validation.skip_reason.as_deref(), Some("dry run"));

    assert!(dir.path().join("results/run_meta_t1.json").exists());
    assert!(!dir.path().join("results/wf_stability_t1.csv").exists());
}

#[test]
fn dry_run_with_pack_fails_the_gate() {
    let dir = tempfile::tempdir().unwrap();
    let (base, _) = write_grids(dir.path());
    let mut cfg = config(dir.path(), &base, None);
    cfg.dry_run = true;
    cfg.pack = true;
    cfg.equity_start = NaiveDate::from_ymd_opt(2025, 1, 1);
    cfg.equity_end = NaiveDate::from_ymd_opt(2025, 6, 30);

    let report = pipeline::run(&cfg, None, &CleanScm).unwrap();
    assert!(!report.success);
    let gate = report.meta.commit_gate.as_ref().unwrap();
    assert_eq!(gate.status, GateStatus::Failed);
    assert!(gate.reason.contains("dry-run"));
}

#[test]
fn full_run_augments_to_quota_validates_and_packs() {
    let dir = tempfile::tempdir().unwrap();
    let (base, aug) = write_grids(dir.path());
    let mut cfg = config(dir.path(), &base, Some(&aug));
    cfg.pack = true;
    cfg.equity_start = NaiveDate::from_ymd_opt(2025, 1, 1);
    cfg.equity_end = NaiveDate::from_ymd_opt(2025, 6, 30);

    let report = pipeline::run(&cfg, Some(&HealthyEvaluator), &CleanScm).unwrap();
    assert!(report.success);

    // Base yields two candidates, under the quota of five; the augmentation
    // stage brings the grid to six.
    assert_eq!(report.meta.generation.len(), 2);
    assert_eq!(report.meta.generation[0].combos_evaluated, 2);
    assert_eq!(report.meta.generation[1].combos_evaluated, 4);

    let selection = report.meta.selection.as_ref().unwrap();
    assert_eq!(selection.adoption_level.as_deref(), Some("L0"));
    assert_eq!(selection.selected.len(), 6);
    assert_eq!(selection.duplicates_removed, 0);

    let validation = report.meta.validation.as_ref().unwrap();
    assert!(!validation.skipped);
    assert_eq!(validation.considered, 6);
    assert_eq!(validation.survivors.len(), 6);

    let gate = report.meta.commit_gate.as_ref().unwrap();
    assert_eq!(gate.status, GateStatus::Passed);

    let results = dir.path().join("results");
    for name in [
        "wf_stability_t1.csv",
        "wf_stability_summary_t1.csv",
        "select_candidates_t1.json",
        "select_candidates_t1.log",
        "wf_validation_t1.csv",
        "wf_validation_summary_t1.csv",
        "wf_validation_t1.json",
        "final_candidates_t1.csv",
        "run_meta_t1.json",
        "README_t1.md",
        "pack_t1.zip",
    ] {
        assert!(results.join(name).exists(), "missing artifact {}", name);
    }

    let meta_json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(results.join("run_meta_t1.json")).unwrap())
            .unwrap();
    assert_eq!(meta_json["timestamp"], "t1");
    assert_eq!(meta_json["commit_gate"]["status"], "passed");
    assert_eq!(meta_json["git"]["commit"], "abc1234");

    let readme = fs::read_to_string(results.join("README_t1.md")).unwrap();
    assert!(readme.contains("equity window: 2025-01-01 .. 2025-06-30"));
    assert!(readme.contains("commit: abc1234"));
}

#[test]
fn unmet_quota_skips_validation_and_fails_a_requested_pack() {
    let dir = tempfile::tempdir().unwrap();
    let (base, _) = write_grids(dir.path());
    let mut cfg = config(dir.path(), &base, None);
    cfg.pack = true;
    cfg.equity_start = NaiveDate::from_ymd_opt(2025, 1, 1);
    cfg.equity_end = NaiveDate::from_ymd_opt(2025, 6, 30);

    let report = pipeline::run(&cfg, Some(&HopelessEvaluator), &CleanScm).unwrap();
    assert!(!report.success);

    let selection = report.meta.selection.as_ref().unwrap();
    assert!(selection.adoption_level.is_none());
    assert!(selection.blocking_condition.is_some());
    // Every widening level ran before giving up.
    assert_eq!(selection.levels.len(), 3);

    let validation = report.meta.validation.as_ref().unwrap();
    assert!(validation.skipped);
    assert!(validation.skip_reason.as_deref().unwrap().contains("quota unmet"));

    let gate = report.meta.commit_gate.as_ref().unwrap();
    assert_eq!(gate.status, GateStatus::Failed);
    assert_eq!(gate.reason, "No candidates met thresholds.");
    assert!(!dir.path().join("results/pack_t1.zip").exists());
}

#[test]
fn dirty_tree_fails_the_gate_and_blocks_the_pack() {
    let dir = tempfile::tempdir().unwrap();
    let (base, aug) = write_grids(dir.path());
    let mut cfg = config(dir.path(), &base, Some(&aug));
    cfg.pack = true;
    cfg.equity_start = NaiveDate::from_ymd_opt(2025, 1, 1);
    cfg.equity_end = NaiveDate::from_ymd_opt(2025, 6, 30);

    let report = pipeline::run(&cfg, Some(&HealthyEvaluator), &DirtyScm).unwrap();
    assert!(!report.success);

    let gate = report.meta.commit_gate.as_ref().unwrap();
    assert_eq!(gate.status, GateStatus::Failed);
    assert!(gate.reason.contains("src/strategy.rs"));
    assert_eq!(
        gate.recommendation.as_deref(),
        Some("commit recommended (3 uncommitted)")
    );
    assert!(report.meta.pack.is_none());
    assert!(!dir.path().join("results/pack_t1.zip").exists());

    // The run itself still completed; only the gate blocked the bundle.
    assert!(!report.meta.validation.as_ref().unwrap().skipped);
    assert!(dir.path().join("results/final_candidates_t1.csv").exists());
}

#[test]
fn cap_bounds_augment_passes_but_never_the_base_grid() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("base_grid.json");
    fs::write(
        &base,
        r#"{
          "parameters": {
            "OB_KTP": {"kind": "values", "values": [1, 2, 3, 4, 5, 6]},
            "OB_TREND_SMA": {"kind": "values", "values": [0, 50, 100, 150]}
          }
        }"#,
    )
    .unwrap();
    let aug = dir.path().join("aug_grid.json");
    fs::write(
        &aug,
        r#"{"stages": [
          {"name": "widen_ktp", "adjustments": {
            "OB_KTP": {"action": "add_values",
                       "values": [7, 8, 9, 10, 11, 12, 13, 14, 15, 16]}}}
        ]}"#,
    )
    .unwrap();

    let mut cfg = config(dir.path(), &base, Some(&aug));
    cfg.max_combinations = 5;
    cfg.n_min = 9999;

    let report = pipeline::run(&cfg, Some(&HopelessEvaluator), &CleanScm).unwrap();
    assert!(report.success);

    // 24 base combinations, well past the cap of 5, all evaluated.
    assert_eq!(report.meta.generation[0].combos_total, 24);
    assert_eq!(report.meta.generation[0].combos_scheduled, 24);
    assert_eq!(report.meta.generation[0].combos_evaluated, 24);

    // The augment stage adds 40 fresh combinations and gets subsampled.
    assert_eq!(report.meta.generation[1].combos_after_filter, 40);
    assert_eq!(report.meta.generation[1].combos_scheduled, 5);
    assert_eq!(report.meta.generation[1].combos_evaluated, 5);
}

#[test]
fn run_without_pack_leaves_gate_not_requested_and_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let (base, aug) = write_grids(dir.path());
    let cfg = config(dir.path(), &base, Some(&aug));

    let report = pipeline::run(&cfg, Some(&HealthyEvaluator), &DirtyScm).unwrap();
    assert!(report.success);
    let gate = report.meta.commit_gate.as_ref().unwrap();
    assert_eq!(gate.status, GateStatus::NotRequested);
}

#[test]
fn missing_equity_window_fails_a_requested_pack() {
    let dir = tempfile::tempdir().unwrap();
    let (base, aug) = write_grids(dir.path());
    let mut cfg = config(dir.path(), &base, Some(&aug));
    cfg.pack = true;

    let report = pipeline::run(&cfg, Some(&HealthyEvaluator), &CleanScm).unwrap();
    assert!(!report.success);
    let gate = report.meta.commit_gate.as_ref().unwrap();
    assert_eq!(gate.status, GateStatus::Failed);
    assert!(gate.reason.contains("equity"));

    // The run completed and the verdict is on disk, not just in memory.
    let meta_json: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(dir.path().join("results/run_meta_t1.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(meta_json["commit_gate"]["status"], "failed");
    assert!(!meta_json["validation"].is_null());
}

#[test]
fn live_run_without_evaluator_is_an_input_error() {
    let dir = tempfile::tempdir().unwrap();
    let (base, _) = write_grids(dir.path());
    let cfg = config(dir.path(), &base, None);
    assert!(pipeline::run(&cfg, None, &CleanScm).is_err());
}
