use std::cmp::Ordering;
use std::path::Path;

use serde::Serialize;

use crate::error::Result;
use crate::evaluator::Evaluator;
use crate::grid::{ParameterCombination, SummaryRecord, summarize};
use crate::selection::SelectedCandidate;

/// The one fixed criteria tuple every validated candidate must clear.
/// Unlike selection there is no widening here.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StrictCriteria {
    pub pf_min: f64,
    pub ret_min: f64,
    pub dd_max: f64,
    pub pf_drift_min: f64,
}

impl Default for StrictCriteria {
    fn default() -> Self {
        StrictCriteria {
            pf_min: 1.05,
            ret_min: 0.0,
            dd_max: 20.0,
            pf_drift_min: -0.10,
        }
    }
}

impl StrictCriteria {
    pub fn meets(&self, record: &SummaryRecord, trades_min: u64) -> bool {
        record.pf_avg >= self.pf_min
            && record.ret_avg >= self.ret_min
            && record.dd_max <= self.dd_max
            && record.pf_drift >= self.pf_drift_min
            && record.trades_min >= trades_min
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub strict: StrictCriteria,
    pub trades_min: u64,
    pub considered: usize,
    pub survivors: Vec<SummaryRecord>,
    pub raw_csv: Option<String>,
    pub summary_csv: Option<String>,
    pub final_csv: Option<String>,
    pub skipped: bool,
    pub skip_reason: Option<String>,
}

impl ValidationOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        ValidationOutcome {
            strict: StrictCriteria::default(),
            trades_min: 0,
            considered: 0,
            survivors: Vec::new(),
            raw_csv: None,
            summary_csv: None,
            final_csv: None,
            skipped: true,
            skip_reason: Some(reason.into()),
        }
    }
}

/// Re-evaluates the selected candidates over the held-out validation splits
/// and applies the strict criteria. Survivors come back in final order:
/// descending profit factor, then ascending max drawdown, then descending
/// return.
#[allow(clippy::too_many_arguments)]
pub fn run_validation(
    candidates: &[SelectedCandidate],
    validation_splits: &[u32],
    strict: StrictCriteria,
    trades_min: u64,
    raw_path: &Path,
    summary_path: &Path,
    final_path: &Path,
    evaluator: &dyn Evaluator,
) -> Result<ValidationOutcome> {
    for path in [raw_path, summary_path, final_path] {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
    }

    let mut summaries = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let combo = ParameterCombination {
            values: candidate.record.values.clone(),
            origin: "validation".to_string(),
        };
        let param_names: Vec<String> = combo.values.keys().cloned().collect();
        let mut evals = Vec::with_capacity(validation_splits.len());
        for &split in validation_splits {
            evals.push(evaluator.evaluate(&combo, split)?);
        }
        crate::grid::append_raw_rows(raw_path, &param_names, &combo, &evals)?;
        let summary = summarize(&combo, &evals);
        crate::grid::append_summary_row(summary_path, &param_names, &summary)?;
        summaries.push(summary);
    }

    let mut survivors: Vec<SummaryRecord> = summaries
        .iter()
        .filter(|s| strict.meets(s, trades_min))
        .cloned()
        .collect();
    survivors.sort_by(compare_final);

    if !survivors.is_empty() {
        let param_names: Vec<String> = survivors[0].values.keys().cloned().collect();
        for survivor in &survivors {
            crate::grid::append_summary_row(final_path, &param_names, survivor)?;
        }
    }

    tracing::info!(
        "validation: {} candidates, {} survivors",
        candidates.len(),
        survivors.len()
    );

    Ok(ValidationOutcome {
        strict,
        trades_min,
        considered: candidates.len(),
        survivors,
        raw_csv: Some(raw_path.display().to_string()),
        summary_csv: Some(summary_path.display().to_string()),
        final_csv: Some(final_path.display().to_string()),
        skipped: false,
        skip_reason: None,
    })
}

fn compare_final(a: &SummaryRecord, b: &SummaryRecord) -> Ordering {
    b.pf_avg
        .partial_cmp(&a.pf_avg)
        .unwrap_or(Ordering::Equal)
        .then(a.dd_max.partial_cmp(&b.dd_max).unwrap_or(Ordering::Equal))
        .then(b.ret_avg.partial_cmp(&a.ret_avg).unwrap_or(Ordering::Equal))
}
