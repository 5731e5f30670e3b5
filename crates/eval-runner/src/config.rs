//! Harness configuration.
//!
//! Layering, lowest to highest: built-in defaults, `<evals_dir>/harness.yaml`,
//! environment variables, CLI flags. The environment is captured once by the
//! caller into [`EnvOverrides`]; nothing below reads it directly.

use crate::sandbox::DEFAULT_BRANCH_PREFIX;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "harness.yaml";
pub const DEFAULT_PARALLEL: usize = 4;

pub const ENV_EVAL_MODEL: &str = "EVAL_MODEL";
pub const ENV_JUDGE_MODEL: &str = "JUDGE_MODEL";
pub const ENV_EVAL_TIMEOUT: &str = "EVAL_TIMEOUT";
pub const ENV_JUDGE_TIMEOUT: &str = "JUDGE_TIMEOUT";
pub const ENV_PARALLEL: &str = "EVAL_PARALLEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    /// Fixed batches of `max` suites; a batch finishes before the next starts.
    #[default]
    Batched,
    /// Refilling pool: a new suite starts as soon as any worker exits.
    Pool,
}

impl Schedule {
    pub fn as_str(self) -> &'static str {
        match self {
            Schedule::Batched => "batched",
            Schedule::Pool => "pool",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSection {
    /// argv template; the prompt is written to stdin.
    pub command: Vec<String>,
}

impl Default for TargetSection {
    fn default() -> Self {
        Self {
            command: ["claude", "-p", "--model", "{{model}}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeSection {
    pub command: Vec<String>,
    /// Overrides the built-in rubric template.
    pub rubric: Option<String>,
}

impl Default for JudgeSection {
    fn default() -> Self {
        Self {
            command: TargetSection::default().command,
            rubric: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsSection {
    pub eval: String,
    pub judge: String,
}

impl Default for ModelsSection {
    fn default() -> Self {
        Self {
            eval: "sonnet".to_string(),
            judge: "sonnet".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    /// 0 disables the bound.
    pub eval_seconds: u64,
    pub judge_seconds: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            eval_seconds: 300,
            judge_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelSection {
    pub default_max: usize,
    pub schedule: Schedule,
}

impl Default for ParallelSection {
    fn default() -> Self {
        Self {
            default_max: DEFAULT_PARALLEL,
            schedule: Schedule::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub branch_prefix: String,
    /// Defaults to `$TMPDIR/eval-sandbox`.
    pub root: Option<PathBuf>,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
            root: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggersSection {
    /// Used for suites without a `<suite>.triggers` sidecar.
    pub default: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub target: TargetSection,
    pub judge: JudgeSection,
    pub models: ModelsSection,
    pub timeouts: TimeoutsSection,
    pub parallel: ParallelSection,
    pub sandbox: SandboxSection,
    pub triggers: TriggersSection,
    /// Relative paths resolve against the project root.
    pub results_dir: PathBuf,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            target: TargetSection::default(),
            judge: JudgeSection::default(),
            models: ModelsSection::default(),
            timeouts: TimeoutsSection::default(),
            parallel: ParallelSection::default(),
            sandbox: SandboxSection::default(),
            triggers: TriggersSection::default(),
            results_dir: PathBuf::from("evals").join("results"),
        }
    }
}

impl HarnessConfig {
    /// Load `path` if it exists, otherwise the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: HarnessConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.target.command.is_empty() {
            return Err(anyhow!("target.command must not be empty"));
        }
        if self.judge.command.is_empty() {
            return Err(anyhow!("judge.command must not be empty"));
        }
        if self.parallel.default_max == 0 {
            return Err(anyhow!("parallel.default_max must be at least 1"));
        }
        Ok(())
    }

    pub fn apply_env(&mut self, env: &EnvOverrides) {
        if let Some(model) = &env.eval_model {
            self.models.eval = model.clone();
        }
        if let Some(model) = &env.judge_model {
            self.models.judge = model.clone();
        }
        if let Some(secs) = env.eval_timeout {
            self.timeouts.eval_seconds = secs;
        }
        if let Some(secs) = env.judge_timeout {
            self.timeouts.judge_seconds = secs;
        }
        if let Some(max) = env.parallel {
            self.parallel.default_max = max.max(1);
        }
    }

    pub fn eval_timeout(&self) -> Option<Duration> {
        seconds_to_bound(self.timeouts.eval_seconds)
    }

    pub fn judge_timeout(&self) -> Option<Duration> {
        seconds_to_bound(self.timeouts.judge_seconds)
    }
}

fn seconds_to_bound(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Environment-provided overrides, captured once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub eval_model: Option<String>,
    pub judge_model: Option<String>,
    pub eval_timeout: Option<u64>,
    pub judge_timeout: Option<u64>,
    pub parallel: Option<usize>,
}

impl EnvOverrides {
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: BTreeMap<String, String> = vars.into_iter().collect();
        let text = |key: &str| {
            vars.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let number = |key: &str| -> Result<Option<u64>> {
            text(key)
                .map(|v| {
                    v.parse::<u64>()
                        .map_err(|_| anyhow!("{} must be a non-negative integer, got `{}`", key, v))
                })
                .transpose()
        };
        Ok(Self {
            eval_model: text(ENV_EVAL_MODEL),
            judge_model: text(ENV_JUDGE_MODEL),
            eval_timeout: number(ENV_EVAL_TIMEOUT)?,
            judge_timeout: number(ENV_JUDGE_TIMEOUT)?,
            parallel: number(ENV_PARALLEL)?.map(|n| n as usize),
        })
    }
}
