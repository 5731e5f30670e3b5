//! Result aggregation and reporting.

use crate::fsutil::{atomic_write_bytes, atomic_write_json_pretty};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

pub const SUMMARY_TEXT_FILE: &str = "summary.txt";
pub const SUMMARY_JSON_FILE: &str = "summary.json";
pub const LATEST_LINK: &str = "latest";
const NOTES_WIDTH: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Trigger,
    NoTrigger,
}

impl TriggerKind {
    pub fn from_should_trigger(should_trigger: bool) -> Self {
        if should_trigger {
            TriggerKind::Trigger
        } else {
            TriggerKind::NoTrigger
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::Trigger => "trigger",
            TriggerKind::NoTrigger => "no-trigger",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowStatus {
    Ok,
    ErrorExit,
    Timeout,
    InvokeError,
    Crashed,
}

impl RowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RowStatus::Ok => "OK",
            RowStatus::ErrorExit => "ERROR_EXIT",
            RowStatus::Timeout => "TIMEOUT",
            RowStatus::InvokeError => "INVOKE_ERROR",
            RowStatus::Crashed => "CRASHED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryLine {
    pub suite: String,
    pub case_id: String,
    pub trigger: TriggerKind,
    pub passed: bool,
    pub score: u8,
    pub status: RowStatus,
    pub notes: String,
}

impl SummaryLine {
    /// Stands in for a whole suite whose worker never reported.
    pub fn crashed(suite: &str, log_path: &Path) -> Self {
        Self {
            suite: suite.to_string(),
            case_id: "<crashed>".to_string(),
            trigger: TriggerKind::Trigger,
            passed: false,
            score: 0,
            status: RowStatus::Crashed,
            notes: format!("crashed: worker wrote no results, see {}", log_path.display()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub passed: usize,
    pub failed: usize,
}

impl RunTotals {
    pub fn from_lines(lines: &[SummaryLine]) -> Self {
        let passed = lines.iter().filter(|l| l.passed).count();
        Self {
            passed,
            failed: lines.len() - passed,
        }
    }

    pub fn total(&self) -> usize {
        self.passed + self.failed
    }

    /// 0 when everything passed, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 {
            1
        } else {
            0
        }
    }
}

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// Aligned summary table. `color` only adds ANSI styling; the plain and
/// colored renderings have identical text.
pub fn render_table(lines: &[SummaryLine], color: bool) -> String {
    let headers = ["SUITE", "CASE", "TYPE", "RESULT", "SCORE", "STATUS", "NOTES"];
    let rows: Vec<[String; 7]> = lines
        .iter()
        .map(|l| {
            [
                l.suite.clone(),
                l.case_id.clone(),
                l.trigger.as_str().to_string(),
                if l.passed { "PASS" } else { "FAIL" }.to_string(),
                l.score.to_string(),
                l.status.as_str().to_string(),
                single_line(&l.notes, NOTES_WIDTH),
            ]
        })
        .collect();

    let mut widths = headers.map(|h| h.chars().count());
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row.iter()) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let header_line = format_row(&headers.map(str::to_string), &widths);
    if color {
        out.push_str(&format!("{}{}{}\n", BOLD, header_line, RESET));
    } else {
        out.push_str(&header_line);
        out.push('\n');
    }
    let rule_len = widths.iter().sum::<usize>() + 2 * (widths.len() - 1);
    out.push_str(&"-".repeat(rule_len));
    out.push('\n');

    for (row, line) in rows.iter().zip(lines) {
        let text = format_row(row, &widths);
        if color {
            let style = if line.passed { GREEN } else { RED };
            out.push_str(&format!("{}{}{}\n", style, text, RESET));
        } else {
            out.push_str(&text);
            out.push('\n');
        }
    }

    let totals = RunTotals::from_lines(lines);
    out.push('\n');
    out.push_str(&format!(
        "total: {}  passed: {}  failed: {}\n",
        totals.total(),
        totals.passed,
        totals.failed
    ));
    out
}

fn format_row(cells: &[String; 7], widths: &[usize; 7]) -> String {
    let last = cells.len() - 1;
    cells
        .iter()
        .zip(widths.iter())
        .enumerate()
        .map(|(i, (cell, w))| {
            if i == last {
                cell.clone()
            } else {
                format!("{:<width$}", cell, width = *w)
            }
        })
        .collect::<Vec<_>>()
        .join("  ")
        .trim_end()
        .to_string()
}

fn single_line(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", cut)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub schema_version: String,
    pub run_id: String,
    pub mode: String,
    pub created_at: String,
    pub totals: RunTotals,
    pub lines: Vec<SummaryLine>,
}

/// Write `summary.txt` and `summary.json` into the run directory.
pub fn write_summary(
    run_dir: &Path,
    run_id: &str,
    mode: &str,
    lines: &[SummaryLine],
) -> Result<RunTotals> {
    let totals = RunTotals::from_lines(lines);
    atomic_write_bytes(
        &run_dir.join(SUMMARY_TEXT_FILE),
        render_table(lines, false).as_bytes(),
    )?;
    let summary = RunSummary {
        schema_version: "run_summary_v1".to_string(),
        run_id: run_id.to_string(),
        mode: mode.to_string(),
        created_at: Utc::now().to_rfc3339(),
        totals,
        lines: lines.to_vec(),
    };
    atomic_write_json_pretty(&run_dir.join(SUMMARY_JSON_FILE), &summary)?;
    info!(
        passed = totals.passed,
        failed = totals.failed,
        path = %run_dir.join(SUMMARY_TEXT_FILE).display(),
        "summary written"
    );
    Ok(totals)
}

/// Point `<results_root>/latest` at `run_dir`, replacing any previous link
/// atomically (new link under a temp name, then renamed over the old one).
pub fn update_latest(results_root: &Path, run_dir: &Path) -> Result<()> {
    let link = results_root.join(LATEST_LINK);
    let target = run_dir
        .strip_prefix(results_root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| run_dir.to_path_buf());
    let tmp = results_root.join(format!(".{}.tmp.{}", LATEST_LINK, std::process::id()));
    let _ = fs::remove_file(&tmp);
    std::os::unix::fs::symlink(&target, &tmp)
        .with_context(|| format!("failed to create link {}", tmp.display()))?;
    fs::rename(&tmp, &link).with_context(|| format!("failed to update {}", link.display()))?;
    Ok(())
}
