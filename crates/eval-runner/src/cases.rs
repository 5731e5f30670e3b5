//! Suite discovery and test-case loading.
//!
//! A suite is one CSV file with the header
//! `id,should_trigger,prompt,expected_behaviors`. Fields follow RFC 4180
//! quoting, so a prompt containing commas must be quoted. The
//! `expected_behaviors` column is a `|`-separated ordered list.

use crate::fsutil::sanitize_component;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const BEHAVIOR_DELIMITER: char = '|';
pub const TRIGGERS_EXTENSION: &str = "triggers";
const SUITE_EXTENSION: &str = "csv";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub should_trigger: bool,
    pub prompt: String,
    pub expected_behaviors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SuiteManifest {
    pub id: String,
    pub path: PathBuf,
    pub cases: Vec<TestCase>,
    /// Phrases whose presence marks a false trigger on negative cases.
    pub trigger_phrases: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum MalformedSuiteError {
    #[error("{}: cannot read suite file: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{}: missing required column `{column}`", .path.display())]
    MissingColumn { path: PathBuf, column: &'static str },
    #[error("{}: line {line}: {message}", .path.display())]
    Row {
        path: PathBuf,
        line: u64,
        message: String,
    },
    #[error("{}: suite defines no test cases", .path.display())]
    Empty { path: PathBuf },
}

struct Columns {
    id: usize,
    should_trigger: usize,
    prompt: usize,
    expected_behaviors: usize,
}

impl Columns {
    fn resolve(path: &Path, headers: &csv::StringRecord) -> Result<Self, MalformedSuiteError> {
        let find = |column: &'static str| {
            headers
                .iter()
                .position(|h| normalize_header(h) == normalize_header(column))
                .ok_or_else(|| MalformedSuiteError::MissingColumn {
                    path: path.to_path_buf(),
                    column,
                })
        };
        Ok(Self {
            id: find("id")?,
            should_trigger: find("should_trigger")?,
            prompt: find("prompt")?,
            expected_behaviors: find("expected_behaviors")?,
        })
    }
}

/// `shouldTrigger`, `should_trigger` and `Should Trigger` all match.
fn normalize_header(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" => Some(true),
        "false" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

pub fn split_behaviors(raw: &str) -> Vec<String> {
    raw.split(BEHAVIOR_DELIMITER)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read the test cases of one suite file, in file order. Prompts are kept
/// byte for byte; only the id and flag columns are trimmed.
pub fn load_cases(path: &Path) -> Result<Vec<TestCase>, MalformedSuiteError> {
    let unreadable = |source| MalformedSuiteError::Unreadable {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .from_path(path)
        .map_err(unreadable)?;
    let headers = reader.headers().map_err(unreadable)?.clone();
    let columns = Columns::resolve(path, &headers)?;

    let mut cases = Vec::new();
    // Keyed by the file-name form of the id, which names output artifacts.
    let mut seen: BTreeMap<String, String> = BTreeMap::new();
    for record in reader.records() {
        let record = record.map_err(|source| {
            let line = source.position().map(|p| p.line()).unwrap_or(0);
            MalformedSuiteError::Row {
                path: path.to_path_buf(),
                line,
                message: source.to_string(),
            }
        })?;
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        let row_error = |message: String| MalformedSuiteError::Row {
            path: path.to_path_buf(),
            line,
            message,
        };
        if record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        let field = |idx: usize| record.get(idx).unwrap_or("");

        let id = field(columns.id).trim().to_string();
        if id.is_empty() {
            return Err(row_error("empty id".to_string()));
        }
        if let Some(previous) = seen.insert(sanitize_component(&id), id.clone()) {
            return Err(row_error(if previous == id {
                format!("duplicate id `{}`", id)
            } else {
                format!("id `{}` clashes with `{}` once made file-safe", id, previous)
            }));
        }
        let raw_trigger = field(columns.should_trigger);
        let should_trigger = parse_bool(raw_trigger).ok_or_else(|| {
            row_error(format!(
                "should_trigger must be true/false, got `{}`",
                raw_trigger
            ))
        })?;
        let prompt = field(columns.prompt).to_string();
        if prompt.trim().is_empty() {
            return Err(row_error(format!("case `{}` has an empty prompt", id)));
        }
        cases.push(TestCase {
            id,
            should_trigger,
            prompt,
            expected_behaviors: split_behaviors(field(columns.expected_behaviors)),
        });
    }

    if cases.is_empty() {
        return Err(MalformedSuiteError::Empty {
            path: path.to_path_buf(),
        });
    }
    Ok(cases)
}

/// Load a suite file plus its trigger phrases. The sidecar
/// `<stem>.triggers` wins over `default_triggers` when present.
pub fn load_suite(path: &Path, default_triggers: &[String]) -> Result<SuiteManifest> {
    let id = suite_id_for(path)?;
    let cases = load_cases(path)?;
    let sidecar = path.with_extension(TRIGGERS_EXTENSION);
    let trigger_phrases = if sidecar.is_file() {
        parse_trigger_phrases(&fs::read_to_string(&sidecar)?)
    } else {
        default_triggers.to_vec()
    };
    Ok(SuiteManifest {
        id,
        path: path.to_path_buf(),
        cases,
        trigger_phrases,
    })
}

pub fn parse_trigger_phrases(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn suite_id_for(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("suite path has no usable file name: {}", path.display()))
}

/// Find suite files under `evals_dir` (at most one directory deep), sorted by
/// suite id. `filter` is a suite id or `all`.
pub fn discover_suites(
    evals_dir: &Path,
    filter: &str,
    exclude: &[PathBuf],
) -> Result<Vec<PathBuf>> {
    if !evals_dir.is_dir() {
        return Err(anyhow!("evals directory not found: {}", evals_dir.display()));
    }
    let mut found: Vec<(String, PathBuf)> = Vec::new();
    let walker = WalkDir::new(evals_dir)
        .max_depth(2)
        .into_iter()
        .filter_entry(|e| !exclude.iter().any(|x| e.path().starts_with(x)));
    for entry in walker {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().and_then(|e| e.to_str()) != Some(SUITE_EXTENSION)
        {
            continue;
        }
        let id = suite_id_for(path)?;
        let key = sanitize_component(&id);
        let clash = found
            .iter()
            .find(|(existing, _)| sanitize_component(existing) == key);
        if let Some((existing, other)) = clash {
            let what = if *existing == id {
                format!("suite id `{}` is defined twice", id)
            } else {
                format!("suite ids `{}` and `{}` map to the same name", existing, id)
            };
            return Err(anyhow!("{}: {} and {}", what, other.display(), path.display()));
        }
        found.push((id, path.to_path_buf()));
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));

    if filter == "all" {
        return Ok(found.into_iter().map(|(_, p)| p).collect());
    }
    let selected: Vec<PathBuf> = found
        .iter()
        .filter(|(id, _)| id == filter)
        .map(|(_, p)| p.clone())
        .collect();
    if selected.is_empty() {
        let known = found
            .iter()
            .map(|(id, _)| id.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(anyhow!(
            "unknown suite `{}` (available: {})",
            filter,
            if known.is_empty() { "none" } else { &known }
        ));
    }
    Ok(selected)
}
