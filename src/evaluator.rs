use std::collections::BTreeMap;
use std::process::Command;

use crate::error::{PipelineError, Result};
use crate::grid::ParameterCombination;

/// Metrics reported by one evaluator invocation for one split.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitEvaluation {
    pub split: u32,
    pub trades: u64,
    pub profit_factor: f64,
    pub return_pct: f64,
    pub max_drawdown_pct: f64,
}

/// Black-box backtest seam. The pipeline never inspects how metrics are
/// produced; tests substitute deterministic implementations.
pub trait Evaluator {
    fn evaluate(&self, combo: &ParameterCombination, split: u32) -> Result<SplitEvaluation>;
}

/// Runs the configured walk-forward command once per (combination, split).
/// Parameters travel as environment variables; metrics come back on stdout.
pub struct SubprocessEvaluator {
    command: Vec<String>,
    base_env: BTreeMap<String, String>,
}

impl SubprocessEvaluator {
    pub fn new(command: Vec<String>, base_env: BTreeMap<String, String>) -> Self {
        SubprocessEvaluator { command, base_env }
    }
}

impl Evaluator for SubprocessEvaluator {
    fn evaluate(&self, combo: &ParameterCombination, split: u32) -> Result<SplitEvaluation> {
        let (program, rest) = self
            .command
            .split_first()
            .ok_or_else(|| PipelineError::Evaluator("empty evaluator command".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(rest);
        for (k, v) in &self.base_env {
            cmd.env(k, v);
        }
        for (k, v) in combo.env_vars() {
            cmd.env(k, v);
        }
        cmd.env("WF_SPLITS", split.to_string());

        let output = cmd
            .output()
            .map_err(|e| PipelineError::Evaluator(format!("failed to spawn {}: {}", program, e)))?;
        if !output.status.success() {
            return Err(PipelineError::Evaluator(format!(
                "{} exited with {} for split {}",
                program, output.status, split
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_split_output(&stdout, split).ok_or_else(|| {
            PipelineError::Evaluator(format!(
                "no parsable metrics line in evaluator output for split {}",
                split
            ))
        })
    }
}

/// Parses lines of the form
/// `split 20: trades=41 PF=1.31 return=5.4% maxDD=8.2%`.
/// PF and return average across matching lines, drawdown takes the max,
/// trades sum. Returns `None` when no line matches.
pub(crate) fn parse_split_output(stdout: &str, split: u32) -> Option<SplitEvaluation> {
    let mut pf_sum = 0.0;
    let mut ret_sum = 0.0;
    let mut dd_max = f64::NEG_INFINITY;
    let mut trades: u64 = 0;
    let mut lines: u32 = 0;

    for line in stdout.lines() {
        let line = line.trim();
        if !line.starts_with("split ") {
            continue;
        }
        let Some((t, pf, ret, dd)) = parse_metrics(line) else {
            continue;
        };
        trades += t;
        pf_sum += pf;
        ret_sum += ret;
        if dd > dd_max {
            dd_max = dd;
        }
        lines += 1;
    }

    if lines == 0 {
        return None;
    }
    Some(SplitEvaluation {
        split,
        trades,
        profit_factor: pf_sum / lines as f64,
        return_pct: ret_sum / lines as f64,
        max_drawdown_pct: dd_max,
    })
}

fn parse_metrics(line: &str) -> Option<(u64, f64, f64, f64)> {
    let mut trades = None;
    let mut pf = None;
    let mut ret = None;
    let mut dd = None;
    for token in line.split_whitespace() {
        if let Some(v) = token.strip_prefix("trades=") {
            trades = v.parse().ok();
        } else if let Some(v) = token.strip_prefix("PF=") {
            pf = v.parse().ok();
        } else if let Some(v) = token.strip_prefix("return=") {
            ret = v.trim_end_matches('%').parse().ok();
        } else if let Some(v) = token.strip_prefix("maxDD=") {
            dd = v.trim_end_matches('%').parse().ok();
        }
    }
    Some((trades?, pf?, ret?, dd?))
}
