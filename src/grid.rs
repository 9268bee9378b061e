use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::time::Instant;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::evaluator::{Evaluator, SplitEvaluation};

const SUMMARY_METRIC_COLUMNS: [&str; 6] =
    ["pf_avg", "ret_avg", "maxDD_max", "trades_min", "pf_drift", "splits"];

/// Declarative base grid: one spec per parameter plus environment shared by
/// every evaluator invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct GridSpec {
    pub parameters: BTreeMap<String, ParameterSpec>,
    #[serde(default)]
    pub base_env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParameterSpec {
    Range { start: f64, stop: f64, step: f64 },
    Values { values: Vec<serde_json::Value> },
    Pairs { values: Vec<(f64, f64)> },
}

/// Augmentation grid: ordered stages of per-parameter adjustments. Stages
/// are cumulative, so stage N means applying stages 1..=N in order.
#[derive(Debug, Clone, Deserialize)]
pub struct AugmentationSpec {
    pub stages: Vec<StageSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub adjustments: BTreeMap<String, Adjustment>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Adjustment {
    /// Widen the numeric span to [min*(1-scale), max*(1+scale)] on `step`.
    RangeExpand { scale: f64, step: f64 },
    AddValues { values: Vec<serde_json::Value> },
    AddPairs { values: Vec<(f64, f64)> },
}

/// One materialized parameter axis. Pair axes render as "up/dn" strings and
/// split into `{name}_UP` / `{name}_DN` when exported to the evaluator.
#[derive(Debug, Clone)]
pub struct Axis {
    pub values: Vec<String>,
    pub pair: bool,
}

/// The fully materialized grid at some augmentation stage.
#[derive(Debug, Clone)]
pub struct GridAxes {
    pub axes: BTreeMap<String, Axis>,
    pub base_env: BTreeMap<String, String>,
}

impl GridAxes {
    pub fn from_spec(spec: &GridSpec) -> Result<Self> {
        let mut axes = BTreeMap::new();
        for (name, param) in &spec.parameters {
            let axis = match param {
                ParameterSpec::Range { start, stop, step } => Axis {
                    values: range_values(*start, *stop, *step)?,
                    pair: false,
                },
                ParameterSpec::Values { values } => Axis {
                    values: values.iter().map(render_json_value).collect(),
                    pair: false,
                },
                ParameterSpec::Pairs { values } => Axis {
                    values: values.iter().map(|(up, dn)| render_pair(*up, *dn)).collect(),
                    pair: true,
                },
            };
            if axis.values.is_empty() {
                return Err(PipelineError::Input(format!(
                    "parameter {} expands to an empty axis",
                    name
                )));
            }
            axes.insert(name.clone(), axis);
        }
        if axes.is_empty() {
            return Err(PipelineError::Input("grid has no parameters".into()));
        }
        Ok(GridAxes { axes, base_env: spec.base_env.clone() })
    }

    /// Applies stages 1..=n of the augmentation spec, in order, on top of the
    /// base axes. New values dedupe against those already on the axis so
    /// fingerprint identities stay stable across stages.
    pub fn with_stages(&self, aug: &AugmentationSpec, n: usize) -> Result<GridAxes> {
        let mut out = self.clone();
        for stage in aug.stages.iter().take(n) {
            for (name, adj) in &stage.adjustments {
                let axis = out.axes.get_mut(name).ok_or_else(|| {
                    PipelineError::Input(format!(
                        "stage {} adjusts unknown parameter {}",
                        stage.name, name
                    ))
                })?;
                apply_adjustment(axis, adj, name, &stage.name)?;
            }
        }
        Ok(out)
    }

    /// Cartesian expansion over the axes in name order. Output is sorted
    /// deterministically by parameter value.
    pub fn expand(&self, origin: &str) -> Vec<ParameterCombination> {
        let names: Vec<&String> = self.axes.keys().collect();
        let mut combos = Vec::new();
        let mut current: Vec<&str> = Vec::with_capacity(names.len());
        expand_rec(&self.axes, &names, 0, &mut current, origin, &mut combos);
        combos.sort_by(|a, b| compare_combinations(a, b));
        combos
    }
}

fn expand_rec<'a>(
    axes: &'a BTreeMap<String, Axis>,
    names: &[&String],
    depth: usize,
    current: &mut Vec<&'a str>,
    origin: &str,
    out: &mut Vec<ParameterCombination>,
) {
    if depth == names.len() {
        let values = names
            .iter()
            .zip(current.iter())
            .map(|(n, v)| ((*n).clone(), (*v).to_string()))
            .collect();
        out.push(ParameterCombination { values, origin: origin.to_string() });
        return;
    }
    for value in &axes[names[depth]].values {
        current.push(value);
        expand_rec(axes, names, depth + 1, current, origin, out);
        current.pop();
    }
}

fn apply_adjustment(axis: &mut Axis, adj: &Adjustment, name: &str, stage: &str) -> Result<()> {
    match adj {
        Adjustment::RangeExpand { scale, step } => {
            if axis.pair {
                return Err(PipelineError::Input(format!(
                    "stage {}: range_expand on pair parameter {}",
                    stage, name
                )));
            }
            let numeric: Vec<f64> = axis
                .values
                .iter()
                .map(|v| {
                    v.parse::<f64>().map_err(|_| {
                        PipelineError::Input(format!(
                            "stage {}: parameter {} has non-numeric value {}",
                            stage, name, v
                        ))
                    })
                })
                .collect::<Result<_>>()?;
            let min = numeric.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = numeric.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let widened = range_values(min * (1.0 - scale), max * (1.0 + scale), *step)?;
            for v in widened {
                if !axis.values.contains(&v) {
                    axis.values.push(v);
                }
            }
        }
        Adjustment::AddValues { values } => {
            if axis.pair {
                return Err(PipelineError::Input(format!(
                    "stage {}: add_values on pair parameter {}",
                    stage, name
                )));
            }
            for v in values {
                let rendered = render_json_value(v);
                if !axis.values.contains(&rendered) {
                    axis.values.push(rendered);
                }
            }
        }
        Adjustment::AddPairs { values } => {
            if !axis.pair {
                return Err(PipelineError::Input(format!(
                    "stage {}: add_pairs on scalar parameter {}",
                    stage, name
                )));
            }
            for (up, dn) in values {
                let rendered = render_pair(*up, *dn);
                if !axis.values.contains(&rendered) {
                    axis.values.push(rendered);
                }
            }
        }
    }
    Ok(())
}

/// One point of the grid: canonical string value per parameter name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterCombination {
    pub values: BTreeMap<String, String>,
    pub origin: String,
}

impl ParameterCombination {
    /// Canonical identity: JSON of the sorted value map. Two combinations
    /// from different stages with equal values share a fingerprint.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(&self.values).unwrap_or_default()
    }

    /// Environment view of the combination. Pair values ("55/45") split into
    /// `{name}_UP` / `{name}_DN`; everything else passes through verbatim.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars = Vec::with_capacity(self.values.len());
        for (name, value) in &self.values {
            match value.split_once('/') {
                Some((up, dn)) => {
                    vars.push((format!("{}_UP", name), up.to_string()));
                    vars.push((format!("{}_DN", name), dn.to_string()));
                }
                None => vars.push((name.clone(), value.clone())),
            }
        }
        vars
    }
}

fn compare_combinations(a: &ParameterCombination, b: &ParameterCombination) -> Ordering {
    for ((_, va), (_, vb)) in a.values.iter().zip(b.values.iter()) {
        let ord = compare_values(va, vb);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Numeric comparison when both sides parse, lexicographic otherwise.
fn compare_values(a: &str, b: &str) -> Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.cmp(b),
    }
}

/// Canonical number rendering: integral values drop the decimal point,
/// everything else trims trailing zeros. "2.0" and "2" from different stages
/// must map to the same identity.
pub fn format_number(x: f64) -> String {
    if x == x.trunc() && x.abs() < 1e15 {
        format!("{}", x as i64)
    } else {
        let s = format!("{:.10}", x);
        let s = s.trim_end_matches('0').trim_end_matches('.');
        s.to_string()
    }
}

fn render_json_value(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::Number(n) => match n.as_f64() {
            Some(f) => format_number(f),
            None => n.to_string(),
        },
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_pair(up: f64, dn: f64) -> String {
    format!("{}/{}", format_number(up), format_number(dn))
}

/// Inclusive arithmetic progression with a tolerance of step/1e6 on the stop
/// bound, so 1.0..=2.0 step 0.2 yields six values despite float error.
pub fn range_values(start: f64, stop: f64, step: f64) -> Result<Vec<String>> {
    if step <= 0.0 {
        return Err(PipelineError::Input(format!("non-positive range step {}", step)));
    }
    let eps = step / 1e6;
    let mut values = Vec::new();
    let mut i = 0u64;
    loop {
        let x = start + step * i as f64;
        if x > stop + eps {
            break;
        }
        values.push(format_number(x));
        i += 1;
        if i > 1_000_000 {
            return Err(PipelineError::Input(format!(
                "range {}..{} step {} expands past 1e6 values",
                start, stop, step
            )));
        }
    }
    Ok(values)
}

/// Aggregated metrics for one combination across its stability splits.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryRecord {
    pub values: BTreeMap<String, String>,
    pub pf_avg: f64,
    pub ret_avg: f64,
    pub dd_max: f64,
    pub trades_min: u64,
    pub pf_drift: f64,
    pub splits: usize,
}

impl SummaryRecord {
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(&self.values).unwrap_or_default()
    }
}

/// Collapses per-split rows into a summary. The trade figure is the minimum
/// across splits, so the floor check requires every split to clear it.
pub fn summarize(combo: &ParameterCombination, evals: &[SplitEvaluation]) -> SummaryRecord {
    let n = evals.len().max(1) as f64;
    let pfs: Vec<f64> = evals.iter().map(|e| e.profit_factor).collect();
    SummaryRecord {
        values: combo.values.clone(),
        pf_avg: evals.iter().map(|e| e.profit_factor).sum::<f64>() / n,
        ret_avg: evals.iter().map(|e| e.return_pct).sum::<f64>() / n,
        dd_max: if evals.is_empty() {
            0.0
        } else {
            evals
                .iter()
                .map(|e| e.max_drawdown_pct)
                .fold(f64::NEG_INFINITY, f64::max)
        },
        trades_min: evals.iter().map(|e| e.trades).min().unwrap_or(0),
        pf_drift: pf_drift(&pfs),
        splits: evals.len(),
    }
}

/// Later-half mean minus earlier-half mean; the later half takes the extra
/// element on odd counts. Fewer than two splits yields zero drift.
pub fn pf_drift(pfs: &[f64]) -> f64 {
    if pfs.len() < 2 {
        return 0.0;
    }
    let mid = pfs.len() / 2;
    let earlier: f64 = pfs[..mid].iter().sum::<f64>() / mid as f64;
    let later: f64 = pfs[mid..].iter().sum::<f64>() / (pfs.len() - mid) as f64;
    later - earlier
}

/// Counters and artifact pointers for one generation pass, recorded into the
/// run metadata verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutcome {
    pub mode: String,
    pub stage: Option<String>,
    pub combos_total: usize,
    pub duplicates_skipped: usize,
    pub combos_after_filter: usize,
    pub combos_scheduled: usize,
    pub combos_evaluated: usize,
    pub raw_csv: String,
    pub summary_csv: String,
    pub duration_sec: f64,
    pub dry_run: bool,
}

/// Shared knobs for a generation pass. The combination cap is only ever set
/// for augment passes; the base grid always evaluates in full.
pub struct GenerationPlan<'a> {
    pub stage: Option<String>,
    pub splits: &'a [u32],
    pub raw_path: &'a Path,
    pub summary_path: &'a Path,
    pub max_combinations: Option<usize>,
    pub seed: u64,
    pub dry_run: bool,
}

/// Runs one generation pass over `axes`: expand, drop already-evaluated
/// fingerprints, bound by the cap with a seeded subsample, then evaluate
/// each survivor over every split and append to the raw/summary tables.
///
/// Base mode (stage `None`) truncates any existing tables for the run tag;
/// augment passes append. `evaluated` carries fingerprints across stages.
pub fn run_generation(
    axes: &GridAxes,
    plan: &GenerationPlan<'_>,
    evaluated: &mut HashSet<String>,
    evaluator: Option<&dyn Evaluator>,
) -> Result<GenerationOutcome> {
    let started = Instant::now();
    let mode = match &plan.stage {
        Some(_) => "augment",
        None => "base",
    };
    let origin = plan.stage.clone().unwrap_or_else(|| "base".to_string());

    let combos = axes.expand(&origin);
    let combos_total = combos.len();

    let mut fresh: Vec<ParameterCombination> = Vec::new();
    for combo in combos {
        let fp = combo.fingerprint();
        if evaluated.contains(&fp) {
            continue;
        }
        fresh.push(combo);
    }
    let combos_after_filter = fresh.len();
    let duplicates_skipped = combos_total - combos_after_filter;

    // Cap bounding: a seeded subsample instead of head-truncation so the cap
    // does not bias scheduling toward the low end of the grid.
    if let Some(cap) = plan.max_combinations {
        if fresh.len() > cap {
            let mut rng = StdRng::seed_from_u64(plan.seed);
            fresh.shuffle(&mut rng);
            fresh.truncate(cap);
            fresh.sort_by(|a, b| compare_combinations(a, b));
        }
    }
    // Dry runs report zero scheduled/evaluated; the dedup bookkeeping below
    // still happens so stage counters stay honest.
    let combos_scheduled = if plan.dry_run { 0 } else { fresh.len() };

    if plan.stage.is_none() && !plan.dry_run {
        for path in [plan.raw_path, plan.summary_path] {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
    }

    let mut combos_evaluated = 0usize;
    if plan.dry_run {
        for combo in &fresh {
            evaluated.insert(combo.fingerprint());
        }
    } else {
        let evaluator = evaluator.ok_or_else(|| {
            PipelineError::Input("no evaluator configured for a live run".into())
        })?;
        let param_names: Vec<String> = axes.axes.keys().cloned().collect();
        for (idx, combo) in fresh.iter().enumerate() {
            let mut evals = Vec::with_capacity(plan.splits.len());
            for &split in plan.splits {
                let eval = evaluator.evaluate(combo, split)?;
                evals.push(eval);
            }
            append_raw_rows(plan.raw_path, &param_names, combo, &evals)?;
            let summary = summarize(combo, &evals);
            append_summary_row(plan.summary_path, &param_names, &summary)?;
            evaluated.insert(combo.fingerprint());
            combos_evaluated += 1;
            if (idx + 1) % 50 == 0 || idx + 1 == fresh.len() {
                tracing::info!(
                    "{}: evaluated {}/{} combinations",
                    origin,
                    idx + 1,
                    fresh.len()
                );
            }
        }
    }

    Ok(GenerationOutcome {
        mode: mode.to_string(),
        stage: plan.stage.clone(),
        combos_total,
        duplicates_skipped,
        combos_after_filter,
        combos_scheduled,
        combos_evaluated,
        raw_csv: plan.raw_path.display().to_string(),
        summary_csv: plan.summary_path.display().to_string(),
        duration_sec: started.elapsed().as_secs_f64(),
        dry_run: plan.dry_run,
    })
}

fn open_append(path: &Path) -> Result<(csv::Writer<std::fs::File>, bool)> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let fresh = !path.exists() || fs::metadata(path)?.len() == 0;
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
    Ok((writer, fresh))
}

pub(crate) fn append_raw_rows(
    path: &Path,
    param_names: &[String],
    combo: &ParameterCombination,
    evals: &[SplitEvaluation],
) -> Result<()> {
    let (mut writer, fresh) = open_append(path)?;
    if fresh {
        let mut header: Vec<String> = param_names.to_vec();
        header.extend(
            ["split", "trades", "pf", "return%", "maxDD%"].map(String::from),
        );
        writer.write_record(&header)?;
    }
    for eval in evals {
        let mut row: Vec<String> = param_names
            .iter()
            .map(|n| combo.values.get(n).cloned().unwrap_or_default())
            .collect();
        row.push(eval.split.to_string());
        row.push(eval.trades.to_string());
        row.push(format!("{:.4}", eval.profit_factor));
        row.push(format!("{:.4}", eval.return_pct));
        row.push(format!("{:.4}", eval.max_drawdown_pct));
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

pub(crate) fn append_summary_row(
    path: &Path,
    param_names: &[String],
    summary: &SummaryRecord,
) -> Result<()> {
    let (mut writer, fresh) = open_append(path)?;
    if fresh {
        let mut header: Vec<String> = param_names.to_vec();
        header.extend(SUMMARY_METRIC_COLUMNS.map(String::from));
        writer.write_record(&header)?;
    }
    let mut row: Vec<String> = param_names
        .iter()
        .map(|n| summary.values.get(n).cloned().unwrap_or_default())
        .collect();
    row.push(format!("{:.4}", summary.pf_avg));
    row.push(format!("{:.4}", summary.ret_avg));
    row.push(format!("{:.4}", summary.dd_max));
    row.push(summary.trades_min.to_string());
    row.push(format!("{:.4}", summary.pf_drift));
    row.push(summary.splits.to_string());
    writer.write_record(&row)?;
    writer.flush()?;
    Ok(())
}

/// Loads the cumulative summary table back. Parameter columns are whatever
/// headers are not metric columns, so the loader is schema-agnostic. A
/// missing table is malformed input, not an empty candidate set.
pub fn load_summary_records(path: &Path) -> Result<Vec<SummaryRecord>> {
    if !path.exists() {
        return Err(PipelineError::Input(format!(
            "summary table not found: {}",
            path.display()
        )));
    }
    let mut reader = csv::Reader::from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(String::from).collect();
    let metric: HashSet<&str> = SUMMARY_METRIC_COLUMNS.iter().copied().collect();
    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let mut values = BTreeMap::new();
        let mut pf_avg = 0.0;
        let mut ret_avg = 0.0;
        let mut dd_max = 0.0;
        let mut trades_min = 0u64;
        let mut drift = 0.0;
        let mut splits = 0usize;
        for (header, field) in headers.iter().zip(row.iter()) {
            if metric.contains(header.as_str()) {
                match header.as_str() {
                    "pf_avg" => pf_avg = field.parse().unwrap_or(0.0),
                    "ret_avg" => ret_avg = field.parse().unwrap_or(0.0),
                    "maxDD_max" => dd_max = field.parse().unwrap_or(0.0),
                    "trades_min" => trades_min = field.parse().unwrap_or(0),
                    "pf_drift" => drift = field.parse().unwrap_or(0.0),
                    "splits" => splits = field.parse().unwrap_or(0),
                    _ => {}
                }
            } else {
                values.insert(header.clone(), field.to_string());
            }
        }
        records.push(SummaryRecord {
            values,
            pf_avg,
            ret_avg,
            dd_max,
            trades_min,
            pf_drift: drift,
            splits,
        });
    }
    Ok(records)
}

/// Fingerprints already present in an existing summary table; used for
/// idempotent resume of augmentation runs. No table yet means nothing has
/// been evaluated, so this stays permissive where the record loader is not.
pub fn load_existing_fingerprints(path: &Path) -> Result<HashSet<String>> {
    if !path.exists() {
        return Ok(HashSet::new());
    }
    Ok(load_summary_records(path)?
        .iter()
        .map(|r| r.fingerprint())
        .collect())
}

pub fn load_grid_spec(path: &Path) -> Result<GridSpec> {
    let text = fs::read_to_string(path).map_err(|e| {
        PipelineError::Input(format!("cannot read grid spec {}: {}", path.display(), e))
    })?;
    let spec: GridSpec = serde_json::from_str(&text)
        .map_err(|e| PipelineError::Input(format!("bad grid spec {}: {}", path.display(), e)))?;
    Ok(spec)
}

pub fn load_augmentation_spec(path: &Path) -> Result<AugmentationSpec> {
    let text = fs::read_to_string(path).map_err(|e| {
        PipelineError::Input(format!("cannot read aug spec {}: {}", path.display(), e))
    })?;
    let spec: AugmentationSpec = serde_json::from_str(&text)
        .map_err(|e| PipelineError::Input(format!("bad aug spec {}: {}", path.display(), e)))?;
    Ok(spec)
}
