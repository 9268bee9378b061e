use std::collections::HashSet;

use serde::Serialize;

use crate::error::{PipelineError, Result};
use crate::grid::SummaryRecord;

/// One widening level of acceptance thresholds. Levels are tried in order;
/// later levels are strictly looser.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ThresholdLevel {
    pub pf_min: f64,
    pub ret_min: f64,
    pub dd_max: f64,
}

/// The single reason a candidate was rejected at a level. Attribution checks
/// profit factor first, then return, drawdown, and the trade floor, so every
/// rejection lands in exactly one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    ProfitFactor,
    Return,
    Drawdown,
    Trades,
}

impl RejectReason {
    pub fn label(self) -> &'static str {
        match self {
            RejectReason::ProfitFactor => "profit_factor",
            RejectReason::Return => "return",
            RejectReason::Drawdown => "drawdown",
            RejectReason::Trades => "trades",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LevelOutcome {
    pub name: String,
    pub thresholds: ThresholdLevel,
    pub accepted: usize,
    pub excluded_pf: usize,
    pub excluded_ret: usize,
    pub excluded_dd: usize,
    pub excluded_trades: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectedCandidate {
    pub level: String,
    #[serde(flatten)]
    pub record: SummaryRecord,
}

/// Full audit of one selection pass: per-level tallies for the levels that
/// actually ran, the accepted candidates, and either the adoption level or
/// the condition blocking the quota.
#[derive(Debug, Clone, Serialize)]
pub struct SelectionOutcome {
    pub n_min: usize,
    pub trades_min: u64,
    pub considered: usize,
    pub duplicates_removed: usize,
    pub levels: Vec<LevelOutcome>,
    pub selected: Vec<SelectedCandidate>,
    pub adoption_level: Option<String>,
    pub blocking_condition: Option<RejectReason>,
}

impl SelectionOutcome {
    pub fn quota_met(&self) -> bool {
        self.adoption_level.is_some()
    }

    /// Plain-text audit log, one line per processed level plus a header and
    /// a verdict line.
    pub fn log_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "[select] candidates={} duplicates_removed={} n_min={} trades_min={}",
            self.considered, self.duplicates_removed, self.n_min, self.trades_min
        )];
        for level in &self.levels {
            lines.push(format!(
                "[select] level={} pf_min={} ret_min={} dd_max={} accepted={} \
excluded_pf={} excluded_ret={} excluded_dd={} excluded_trades={}",
                level.name,
                level.thresholds.pf_min,
                level.thresholds.ret_min,
                level.thresholds.dd_max,
                level.accepted,
                level.excluded_pf,
                level.excluded_ret,
                level.excluded_dd,
                level.excluded_trades
            ));
        }
        match (&self.adoption_level, self.blocking_condition) {
            (Some(level), _) => lines.push(format!(
                "[select] adoption_level={} selected={}",
                level,
                self.selected.len()
            )),
            (None, Some(reason)) => lines.push(format!(
                "[select] quota unmet: selected={} blocking_condition={}",
                self.selected.len(),
                reason.label()
            )),
            (None, None) => lines.push(format!(
                "[select] quota unmet: selected={}",
                self.selected.len()
            )),
        }
        lines
    }
}

fn reject_reason(record: &SummaryRecord, level: &ThresholdLevel, trades_min: u64) -> Option<RejectReason> {
    if record.pf_avg < level.pf_min {
        Some(RejectReason::ProfitFactor)
    } else if record.ret_avg < level.ret_min {
        Some(RejectReason::Return)
    } else if record.dd_max > level.dd_max {
        Some(RejectReason::Drawdown)
    } else if record.trades_min < trades_min {
        Some(RejectReason::Trades)
    } else {
        None
    }
}

/// Runs the widening-level selection over the cumulative summary table.
///
/// Duplicated fingerprints collapse to their first occurrence. Each level
/// re-examines everything not yet accepted; once the cumulative accepted
/// count reaches the quota, that level becomes the adoption level and the
/// remaining levels never run. If every level runs and the quota is still
/// unmet, the blocking condition is the most frequent rejection reason
/// summed across every level, ties resolved in attribution order.
pub fn select(
    records: &[SummaryRecord],
    levels: &[ThresholdLevel],
    n_min: usize,
    trades_min: u64,
) -> SelectionOutcome {
    let mut seen = HashSet::new();
    let mut unique: Vec<&SummaryRecord> = Vec::new();
    for record in records {
        if seen.insert(record.fingerprint()) {
            unique.push(record);
        }
    }
    let duplicates_removed = records.len() - unique.len();

    let mut remaining = unique;
    let mut selected = Vec::new();
    let mut level_outcomes = Vec::new();
    let mut adoption_level = None;
    let mut total_tallies = [0usize; 4];

    for (idx, level) in levels.iter().enumerate() {
        let name = format!("L{}", idx);
        let mut accepted = 0usize;
        let mut tallies = [0usize; 4];
        let mut still_remaining = Vec::new();

        for record in remaining {
            match reject_reason(record, level, trades_min) {
                None => {
                    selected.push(SelectedCandidate {
                        level: name.clone(),
                        record: record.clone(),
                    });
                    accepted += 1;
                }
                Some(reason) => {
                    tallies[reason as usize] += 1;
                    still_remaining.push(record);
                }
            }
        }
        remaining = still_remaining;
        for (total, count) in total_tallies.iter_mut().zip(tallies) {
            *total += count;
        }

        level_outcomes.push(LevelOutcome {
            name: name.clone(),
            thresholds: *level,
            accepted,
            excluded_pf: tallies[RejectReason::ProfitFactor as usize],
            excluded_ret: tallies[RejectReason::Return as usize],
            excluded_dd: tallies[RejectReason::Drawdown as usize],
            excluded_trades: tallies[RejectReason::Trades as usize],
        });

        if selected.len() >= n_min {
            adoption_level = Some(name);
            break;
        }
    }

    // Most frequent rejection reason summed over every processed level.
    // Ties go to the earliest reason in attribution order, which is why the
    // scan walks the priority list rather than the tally array.
    let blocking_condition = if adoption_level.is_none() {
        let best = *total_tallies.iter().max().unwrap_or(&0);
        if best == 0 {
            None
        } else {
            [
                RejectReason::ProfitFactor,
                RejectReason::Return,
                RejectReason::Drawdown,
                RejectReason::Trades,
            ]
            .into_iter()
            .find(|r| total_tallies[*r as usize] == best)
        }
    } else {
        None
    };

    SelectionOutcome {
        n_min,
        trades_min,
        considered: records.len() - duplicates_removed,
        duplicates_removed,
        levels: level_outcomes,
        selected,
        adoption_level,
        blocking_condition,
    }
}

/// Parses `pf,ret,dd[;pf,ret,dd...]` into threshold levels.
pub fn parse_levels(text: &str) -> Result<Vec<ThresholdLevel>> {
    let mut levels = Vec::new();
    for (idx, chunk) in text.split(';').enumerate() {
        let chunk = chunk.trim();
        if chunk.is_empty() {
            continue;
        }
        let parts: Vec<&str> = chunk.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(PipelineError::Input(format!(
                "level {} must be pf_min,ret_min,dd_max, got {:?}",
                idx, chunk
            )));
        }
        let parse = |s: &str, what: &str| -> Result<f64> {
            s.parse::<f64>().map_err(|_| {
                PipelineError::Input(format!("level {}: bad {} value {:?}", idx, what, s))
            })
        };
        levels.push(ThresholdLevel {
            pf_min: parse(parts[0], "pf_min")?,
            ret_min: parse(parts[1], "ret_min")?,
            dd_max: parse(parts[2], "dd_max")?,
        });
    }
    if levels.is_empty() {
        return Err(PipelineError::Input(format!("no levels in {:?}", text)));
    }
    Ok(levels)
}
