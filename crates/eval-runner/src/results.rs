//! Cross-process hand-off of per-suite results.
//!
//! Each worker owns exactly two files in the shared directory, named by its
//! suite, so writers never overlap. The lines file is renamed into place
//! before the counts file; a readable counts file therefore implies a
//! complete lines file.

use crate::fsutil::{atomic_write_json_pretty, ensure_dir, sanitize_component};
use crate::report::{RunTotals, SummaryLine};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteResult {
    pub suite: String,
    pub totals: RunTotals,
    pub lines: Vec<SummaryLine>,
}

impl SuiteResult {
    pub fn from_lines(suite: &str, lines: Vec<SummaryLine>) -> Self {
        Self {
            suite: suite.to_string(),
            totals: RunTotals::from_lines(&lines),
            lines,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CountsRecord {
    schema_version: String,
    suite: String,
    passed: usize,
    failed: usize,
}

#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn counts_path(&self, suite: &str) -> PathBuf {
        self.dir.join(format!("{}.counts.json", sanitize_component(suite)))
    }

    fn lines_path(&self, suite: &str) -> PathBuf {
        self.dir.join(format!("{}.lines.json", sanitize_component(suite)))
    }

    pub fn write(&self, suite: &str, result: &SuiteResult) -> Result<()> {
        ensure_dir(&self.dir)?;
        atomic_write_json_pretty(&self.lines_path(suite), &result.lines)?;
        let counts = CountsRecord {
            schema_version: "suite_counts_v1".to_string(),
            suite: suite.to_string(),
            passed: result.totals.passed,
            failed: result.totals.failed,
        };
        atomic_write_json_pretty(&self.counts_path(suite), &counts)
    }

    pub fn read(&self, suite: &str) -> Result<Option<SuiteResult>> {
        let counts_path = self.counts_path(suite);
        if !counts_path.is_file() {
            return Ok(None);
        }
        let counts: CountsRecord = serde_json::from_slice(&fs::read(&counts_path)?)?;
        let lines: Vec<SummaryLine> = serde_json::from_slice(&fs::read(self.lines_path(suite))?)?;
        let totals = RunTotals::from_lines(&lines);
        if counts.suite != suite || totals.passed != counts.passed || totals.failed != counts.failed
        {
            return Err(anyhow!(
                "result files for suite {} disagree: counts say {}/{}, lines say {}/{}",
                suite,
                counts.passed,
                counts.failed,
                totals.passed,
                totals.failed
            ));
        }
        Ok(Some(SuiteResult {
            suite: suite.to_string(),
            totals,
            lines,
        }))
    }

    /// Results in the order of `suites`; `None` marks a suite whose worker
    /// left no readable result.
    pub fn read_all(&self, suites: &[String]) -> Vec<(String, Option<SuiteResult>)> {
        suites
            .iter()
            .map(|suite| {
                let result = match self.read(suite) {
                    Ok(result) => result,
                    Err(err) => {
                        warn!(%suite, %err, "unreadable suite result");
                        None
                    }
                };
                (suite.clone(), result)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{RowStatus, TriggerKind};

    fn line(suite: &str, id: &str, passed: bool) -> SummaryLine {
        SummaryLine {
            suite: suite.to_string(),
            case_id: id.to_string(),
            trigger: TriggerKind::NoTrigger,
            passed,
            score: if passed { 100 } else { 0 },
            status: RowStatus::Ok,
            notes: String::new(),
        }
    }

    #[test]
    fn write_then_read_all_preserves_order_and_marks_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResultStore::new(&dir.path().join("results"));
        let a = SuiteResult::from_lines(
            "alpha",
            vec![line("alpha", "1", true), line("alpha", "2", false)],
        );
        store.write("alpha", &a).expect("write alpha");

        let all = store.read_all(&["missing".to_string(), "alpha".to_string()]);
        assert_eq!(all[0].0, "missing");
        assert!(all[0].1.is_none());
        assert_eq!(all[1].1.as_ref(), Some(&a));
    }

    #[test]
    fn counts_without_lines_is_unreadable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResultStore::new(dir.path());
        let a = SuiteResult::from_lines("alpha", vec![line("alpha", "1", true)]);
        store.write("alpha", &a).expect("write");
        fs::remove_file(store.lines_path("alpha")).expect("remove lines");
        assert!(store.read("alpha").is_err());
        assert!(store.read_all(&["alpha".to_string()])[0].1.is_none());
    }

    #[test]
    fn disagreeing_counts_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResultStore::new(dir.path());
        let a = SuiteResult::from_lines("alpha", vec![line("alpha", "1", true)]);
        store.write("alpha", &a).expect("write");
        let tampered = SuiteResult::from_lines("alpha", vec![line("alpha", "1", false)]);
        atomic_write_json_pretty(&store.lines_path("alpha"), &tampered.lines).expect("tamper");
        let err = store.read("alpha").expect_err("must disagree");
        assert!(err.to_string().contains("disagree"));
    }
}
