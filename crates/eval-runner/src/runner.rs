//! Run modes and the per-suite pipeline.

use crate::cases::{discover_suites, load_suite, SuiteManifest};
use crate::config::{HarnessConfig, Schedule};
use crate::fsutil::{atomic_write_json_pretty, ensure_dir, sanitize_component};
use crate::grade::{CommandJudge, GradeOutcome, Grader, GradingStrategy, JudgeVerdict};
use crate::interrupt::{is_interrupted, Interrupt};
use crate::invoke::{invoke_case, InvocationRequest, InvocationStatus, Invoker};
use crate::orchestrator::{run_parallel, ParallelOptions, SelfExecSpawner, WorkerSpawner};
use crate::report::{update_latest, write_summary, RowStatus, RunTotals, SummaryLine, TriggerKind};
use crate::results::{ResultStore, SuiteResult};
use crate::sandbox::{SandboxGuard, SandboxManager, ScopeId};
use crate::template::{CommandTemplate, Template};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub const RUN_STATE_FILE: &str = "run_state.json";
const RESULTS_SUBDIR: &str = ".results";
const LOGS_SUBDIR: &str = "logs";
const PROMPT_EXCERPT_CHARS: usize = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    Dry,
    Sequential,
    Parallel { max: usize, schedule: Schedule },
    Worker { suite: String, run_dir: PathBuf },
}

impl RunMode {
    pub fn label(&self) -> &'static str {
        match self {
            RunMode::Dry => "dry",
            RunMode::Sequential => "sequential",
            RunMode::Parallel { .. } => "parallel",
            RunMode::Worker { .. } => "worker",
        }
    }
}

/// Where one run's artifacts live.
#[derive(Debug, Clone)]
pub struct RunLayout {
    pub results_root: PathBuf,
    pub run_id: String,
    pub run_dir: PathBuf,
}

impl RunLayout {
    /// New timestamp-named run directory under `results_root`.
    pub fn create(results_root: &Path) -> Result<Self> {
        ensure_dir(results_root)?;
        let stamp = format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S"));
        let mut run_id = stamp.clone();
        let mut n = 1;
        while results_root.join(&run_id).exists() {
            n += 1;
            run_id = format!("{}_{}", stamp, n);
        }
        let run_dir = results_root.join(&run_id);
        ensure_dir(&run_dir)?;
        Ok(Self {
            results_root: results_root.to_path_buf(),
            run_id,
            run_dir,
        })
    }

    /// Attach to a run directory created by a parent process.
    pub fn open(run_dir: &Path) -> Result<Self> {
        if !run_dir.is_dir() {
            return Err(anyhow!("run directory not found: {}", run_dir.display()));
        }
        let run_id = run_dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("run directory has no usable name: {}", run_dir.display()))?
            .to_string();
        let results_root = run_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self {
            results_root,
            run_id,
            run_dir: run_dir.to_path_buf(),
        })
    }

    pub fn suite_dir(&self, suite: &str) -> PathBuf {
        self.run_dir.join(sanitize_component(suite))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.run_dir.join(LOGS_SUBDIR)
    }

    pub fn results_dir(&self) -> PathBuf {
        self.run_dir.join(RESULTS_SUBDIR)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunState {
    pub schema_version: String,
    pub run_id: String,
    pub mode: String,
    pub status: RunStatus,
    pub updated_at: String,
}

fn write_run_state(layout: &RunLayout, mode: &str, status: RunStatus) -> Result<()> {
    let state = RunState {
        schema_version: "run_state_v1".to_string(),
        run_id: layout.run_id.clone(),
        mode: mode.to_string(),
        status,
        updated_at: Utc::now().to_rfc3339(),
    };
    atomic_write_json_pretty(&layout.run_dir.join(RUN_STATE_FILE), &state)
}

/// Marks the run `running` on creation. Unless `complete` is called, the drop
/// records `interrupted` or `failed`.
struct RunStateGuard {
    layout: RunLayout,
    mode: String,
    interrupt: Interrupt,
    done: bool,
}

impl RunStateGuard {
    fn new(layout: &RunLayout, mode: &str, interrupt: &Interrupt) -> Result<Self> {
        write_run_state(layout, mode, RunStatus::Running)?;
        Ok(Self {
            layout: layout.clone(),
            mode: mode.to_string(),
            interrupt: interrupt.clone(),
            done: false,
        })
    }

    fn complete(&mut self) -> Result<()> {
        write_run_state(&self.layout, &self.mode, RunStatus::Completed)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for RunStateGuard {
    fn drop(&mut self) {
        if !self.done {
            let status = if self.interrupt.is_triggered() {
                RunStatus::Interrupted
            } else {
                RunStatus::Failed
            };
            let _ = write_run_state(&self.layout, &self.mode, status);
        }
    }
}

/// Per-case record persisted next to the raw output.
#[derive(Debug, Serialize, Deserialize)]
pub struct VerdictRecord {
    pub schema_version: String,
    pub suite: String,
    pub case_id: String,
    pub strategy: GradingStrategy,
    pub invocation_status: InvocationStatus,
    pub duration_ms: u64,
    pub verdict: JudgeVerdict,
    pub notes: String,
    pub judge_response: Option<String>,
}

pub fn verdict_artifact_path(suite_dir: &Path, case_id: &str) -> PathBuf {
    suite_dir.join(format!("{}.verdict.json", sanitize_component(case_id)))
}

fn row_status(status: InvocationStatus) -> RowStatus {
    match status {
        InvocationStatus::Ok => RowStatus::Ok,
        InvocationStatus::ErrorExit { .. } => RowStatus::ErrorExit,
        InvocationStatus::Timeout => RowStatus::Timeout,
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub lines: Vec<SummaryLine>,
    pub totals: RunTotals,
    pub crashed: Vec<String>,
}

/// Everything a run needs, resolved once from configuration.
pub struct Harness {
    config: HarnessConfig,
    evals_dir: PathBuf,
    results_root: PathBuf,
    invoker: Invoker,
    judge_program: String,
    grader: Grader,
    sandboxes: SandboxManager,
    interrupt: Interrupt,
}

impl Harness {
    pub fn new(
        config: HarnessConfig,
        repo_root: &Path,
        evals_dir: &Path,
        interrupt: &Interrupt,
    ) -> Result<Self> {
        let target = CommandTemplate::parse(&config.target.command)
            .context("invalid target.command")?;
        let judge = CommandTemplate::parse(&config.judge.command).context("invalid judge.command")?;
        let judge_program = judge.program().to_string();
        let invoker = Invoker::new(target, config.eval_timeout(), interrupt.clone());
        let judge_invoker = Invoker::new(judge, config.judge_timeout(), interrupt.clone());
        let judge = Box::new(CommandJudge::new(judge_invoker, &config.models.judge, repo_root));
        let grader = match &config.judge.rubric {
            Some(rubric) => Grader::new(
                judge,
                Template::parse(rubric).context("invalid judge.rubric")?,
            ),
            None => Grader::with_default_rubric(judge)?,
        };
        let sandboxes = match &config.sandbox.root {
            Some(root) => SandboxManager::new(repo_root, root, &config.sandbox.branch_prefix),
            None => SandboxManager::with_default_root(repo_root, &config.sandbox.branch_prefix),
        };
        let results_root = if config.results_dir.is_absolute() {
            config.results_dir.clone()
        } else {
            repo_root.join(&config.results_dir)
        };
        Ok(Self {
            config,
            evals_dir: evals_dir.to_path_buf(),
            results_root,
            invoker,
            judge_program,
            grader,
            sandboxes,
            interrupt: interrupt.clone(),
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn sandboxes(&self) -> &SandboxManager {
        &self.sandboxes
    }

    pub fn results_root(&self) -> &Path {
        &self.results_root
    }

    pub fn target_program(&self) -> &str {
        self.invoker.program()
    }

    pub fn judge_program(&self) -> &str {
        &self.judge_program
    }

    /// Discover and load every suite matching `filter`, sorted by id.
    pub fn load_suites(&self, filter: &str) -> Result<Vec<SuiteManifest>> {
        let exclude = [self.results_root.clone()];
        discover_suites(&self.evals_dir, filter, &exclude)?
            .iter()
            .map(|path| load_suite(path, &self.config.triggers.default))
            .collect()
    }

    fn load_one(&self, suite: &str) -> Result<SuiteManifest> {
        self.load_suites(suite)?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("suite {} not found", suite))
    }

    /// Invoke and grade every case of one suite inside a fresh sandbox.
    pub fn run_suite(
        &self,
        layout: &RunLayout,
        manifest: &SuiteManifest,
    ) -> Result<Vec<SummaryLine>> {
        self.interrupt.check()?;
        let suite_dir = layout.suite_dir(&manifest.id);
        ensure_dir(&suite_dir)?;
        let scope = ScopeId::current(Some(&manifest.id));
        let sandbox = SandboxGuard::acquire(&self.sandboxes, &scope)
            .with_context(|| format!("failed to create sandbox for suite {}", manifest.id))?;
        info!(suite = %manifest.id, cases = manifest.cases.len(), "running suite");

        let mut lines = Vec::with_capacity(manifest.cases.len());
        for case in &manifest.cases {
            self.interrupt.check()?;
            lines.push(self.run_case(sandbox.path(), &suite_dir, manifest, case)?);
        }

        if let Err(err) = sandbox.release() {
            warn!(suite = %manifest.id, %err, "sandbox teardown failed");
        }
        Ok(lines)
    }

    fn run_case(
        &self,
        sandbox_path: &Path,
        suite_dir: &Path,
        manifest: &SuiteManifest,
        case: &crate::cases::TestCase,
    ) -> Result<SummaryLine> {
        let request = InvocationRequest {
            suite: &manifest.id,
            case_id: &case.id,
            prompt: &case.prompt,
            model: &self.config.models.eval,
        };
        let line = |passed: bool, score: u8, status: RowStatus, notes: String| SummaryLine {
            suite: manifest.id.clone(),
            case_id: case.id.clone(),
            trigger: TriggerKind::from_should_trigger(case.should_trigger),
            passed,
            score,
            status,
            notes,
        };

        let invocation = match invoke_case(&self.invoker, sandbox_path, suite_dir, &request) {
            Ok(invocation) => invocation,
            Err(err) if is_interrupted(&err) => return Err(err),
            Err(err) => {
                error!(suite = %manifest.id, case = %case.id, %err, "invocation failed");
                return Ok(line(
                    false,
                    0,
                    RowStatus::InvokeError,
                    format!("invoke failed: {:#}", err),
                ));
            }
        };

        let GradeOutcome {
            strategy,
            verdict,
            notes,
            judge_response,
        } = self
            .grader
            .grade(&manifest.id, &manifest.trigger_phrases, case, &invocation)?;
        let record = VerdictRecord {
            schema_version: "verdict_v1".to_string(),
            suite: manifest.id.clone(),
            case_id: case.id.clone(),
            strategy,
            invocation_status: invocation.status,
            duration_ms: invocation.duration.as_millis() as u64,
            verdict: verdict.clone(),
            notes: notes.clone(),
            judge_response,
        };
        atomic_write_json_pretty(&verdict_artifact_path(suite_dir, &case.id), &record)?;
        info!(
            suite = %manifest.id,
            case = %case.id,
            pass = verdict.overall_pass,
            score = verdict.score,
            "case graded"
        );
        Ok(line(
            verdict.overall_pass,
            verdict.score,
            row_status(invocation.status),
            notes,
        ))
    }

    /// Run suites one after another in this process.
    pub fn run_sequential(&self, suites: &[SuiteManifest]) -> Result<RunReport> {
        let layout = RunLayout::create(&self.results_root)?;
        let mode = RunMode::Sequential;
        let mut guard = RunStateGuard::new(&layout, mode.label(), &self.interrupt)?;
        info!(run_id = %layout.run_id, suites = suites.len(), "sequential run started");

        let mut lines = Vec::new();
        for manifest in suites {
            lines.extend(self.run_suite(&layout, manifest)?);
        }
        self.finish(&layout, &mut guard, mode.label(), lines, Vec::new())
    }

    /// Spawn one worker per suite, bounded by `options.max`.
    pub fn run_parallel(
        &self,
        suites: &[SuiteManifest],
        options: &ParallelOptions,
        forwarded_args: Vec<String>,
    ) -> Result<RunReport> {
        let layout = RunLayout::create(&self.results_root)?;
        let spawner =
            SelfExecSpawner::new(forwarded_args, &layout.run_dir, &layout.logs_dir())?;
        self.run_parallel_with(&layout, suites, options, &spawner)
    }

    pub fn run_parallel_with(
        &self,
        layout: &RunLayout,
        suites: &[SuiteManifest],
        options: &ParallelOptions,
        spawner: &dyn WorkerSpawner,
    ) -> Result<RunReport> {
        let mode = RunMode::Parallel {
            max: options.max,
            schedule: options.schedule,
        };
        let mut guard = RunStateGuard::new(layout, mode.label(), &self.interrupt)?;
        info!(
            run_id = %layout.run_id,
            suites = suites.len(),
            max = options.max,
            schedule = options.schedule.as_str(),
            "parallel run started"
        );
        let ids: Vec<String> = suites.iter().map(|s| s.id.clone()).collect();
        let store = ResultStore::new(&layout.results_dir());
        let outcome = run_parallel(
            &ids,
            options,
            spawner,
            &store,
            &self.sandboxes,
            &self.interrupt,
        )?;
        self.finish(layout, &mut guard, mode.label(), outcome.lines, outcome.crashed)
    }

    /// Worker mode: run one suite and hand its lines to the parent through
    /// the result store. No summary, no `latest` update.
    pub fn run_worker(&self, suite: &str, run_dir: &Path) -> Result<RunTotals> {
        let layout = RunLayout::open(run_dir)?;
        let manifest = self.load_one(suite)?;
        let lines = self.run_suite(&layout, &manifest)?;
        let result = SuiteResult::from_lines(&manifest.id, lines);
        ResultStore::new(&layout.results_dir()).write(&manifest.id, &result)?;
        info!(
            suite = %manifest.id,
            passed = result.totals.passed,
            failed = result.totals.failed,
            "worker done"
        );
        Ok(result.totals)
    }

    fn finish(
        &self,
        layout: &RunLayout,
        guard: &mut RunStateGuard,
        mode: &str,
        lines: Vec<SummaryLine>,
        crashed: Vec<String>,
    ) -> Result<RunReport> {
        let totals = write_summary(&layout.run_dir, &layout.run_id, mode, &lines)?;
        guard.complete()?;
        update_latest(&layout.results_root, &layout.run_dir)?;
        Ok(RunReport {
            run_id: layout.run_id.clone(),
            run_dir: layout.run_dir.clone(),
            lines,
            totals,
            crashed,
        })
    }
}

/// One line per case, nothing is executed.
pub fn dry_run_listing(suites: &[SuiteManifest]) -> String {
    let mut out = String::new();
    let mut count = 0;
    for manifest in suites {
        for case in &manifest.cases {
            count += 1;
            out.push_str(&format!(
                "{}  {}  {}  {}\n",
                manifest.id,
                case.id,
                TriggerKind::from_should_trigger(case.should_trigger).as_str(),
                excerpt(&case.prompt, PROMPT_EXCERPT_CHARS)
            ));
        }
    }
    out.push_str(&format!(
        "\n{} cases in {} suites (dry run, nothing invoked)\n",
        count,
        suites.len()
    ));
    out
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        format!("{}...", flat.chars().take(max_chars).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxSection;
    use crate::report::{SUMMARY_JSON_FILE, SUMMARY_TEXT_FILE, LATEST_LINK};
    use crate::sandbox::test_support::{branches, setup_repo};
    use std::fs;

    const SUITE_CSV: &str = "id,should_trigger,prompt,expected_behaviors\n\
        s1,true,\"Summarize yesterday, briefly\",mentions blockers|lists tasks\n\
        n1,false,What is the weather?,\n";

    fn sh_command(script: &str) -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "{{model}}".to_string(),
        ]
    }

    struct Fixture {
        _root: tempfile::TempDir,
        repo: PathBuf,
        evals: PathBuf,
        sandbox_root: tempfile::TempDir,
    }

    fn fixture(suites: &[(&str, &str)]) -> Fixture {
        let (root, repo) = setup_repo();
        let evals = repo.join("evals");
        fs::create_dir_all(&evals).expect("mkdir evals");
        for (name, csv) in suites {
            fs::write(evals.join(format!("{}.csv", name)), csv).expect("write suite");
        }
        Fixture {
            _root: root,
            repo,
            evals,
            sandbox_root: tempfile::tempdir().expect("sandbox root"),
        }
    }

    fn harness(fx: &Fixture, target: &str, judge: &str) -> Harness {
        let mut config = HarnessConfig::default();
        config.target.command = sh_command(target);
        config.judge.command = sh_command(judge);
        config.triggers.default = vec!["standup summary".to_string()];
        config.sandbox = SandboxSection {
            branch_prefix: "eval-sandbox".to_string(),
            root: Some(fx.sandbox_root.path().to_path_buf()),
        };
        config.results_dir = PathBuf::from("evals/results");
        Harness::new(config, &fx.repo, &fx.evals, &Interrupt::new()).expect("harness")
    }

    const PASSING_JUDGE: &str = "cat >/dev/null; echo '{\"overallPass\":true,\"score\":90,\"checks\":[{\"id\":\"b1\",\"pass\":true,\"notes\":\"ok\"}]}'";

    #[test]
    fn sequential_run_grades_and_cleans_up() {
        let fx = fixture(&[("standup", SUITE_CSV)]);
        let h = harness(&fx, "cat", PASSING_JUDGE);
        let suites = h.load_suites("all").expect("load");
        let report = h.run_sequential(&suites).expect("run");

        assert_eq!(report.lines.len(), 2);
        let positive = &report.lines[0];
        assert_eq!(positive.case_id, "s1");
        assert!(positive.passed);
        assert_eq!(positive.score, 90);
        assert_eq!(positive.status, RowStatus::Ok);
        let negative = &report.lines[1];
        assert_eq!(negative.trigger, TriggerKind::NoTrigger);
        assert!(negative.passed, "{}", negative.notes);
        assert_eq!(report.totals.exit_code(), 0);

        let suite_dir = report.run_dir.join("standup");
        assert!(suite_dir.join("s1.output.txt").is_file());
        let record: VerdictRecord = serde_json::from_slice(
            &fs::read(verdict_artifact_path(&suite_dir, "s1")).expect("read verdict"),
        )
        .expect("parse verdict");
        assert_eq!(record.verdict.score, 90);
        assert!(report.run_dir.join(SUMMARY_TEXT_FILE).is_file());
        assert!(report.run_dir.join(SUMMARY_JSON_FILE).is_file());
        let state: RunState = serde_json::from_slice(
            &fs::read(report.run_dir.join(RUN_STATE_FILE)).expect("read state"),
        )
        .expect("parse state");
        assert_eq!(state.status, RunStatus::Completed);
        let latest = fs::read_link(h.results_root().join(LATEST_LINK)).expect("latest");
        assert_eq!(latest, PathBuf::from(&report.run_id));
        assert!(branches(&fx.repo, "eval-sandbox").is_empty());
        assert_eq!(
            fs::read_dir(fx.sandbox_root.path()).expect("read sandbox root").count(),
            0
        );
    }

    #[test]
    fn trigger_phrase_in_negative_case_fails() {
        let fx = fixture(&[("standup", SUITE_CSV)]);
        let h = harness(&fx, "cat >/dev/null; echo 'Here is your Standup Summary'", PASSING_JUDGE);
        let suites = h.load_suites("standup").expect("load");
        let report = h.run_sequential(&suites).expect("run");
        let negative = &report.lines[1];
        assert!(!negative.passed);
        assert!(negative.notes.contains("standup summary"), "{}", negative.notes);
        assert_eq!(report.totals.exit_code(), 1);
    }

    #[test]
    fn timeout_is_a_failing_row() {
        let fx = fixture(&[("standup", SUITE_CSV)]);
        let mut config = HarnessConfig::default();
        config.target.command = sh_command("sleep 20");
        config.judge.command = sh_command(PASSING_JUDGE);
        config.timeouts.eval_seconds = 1;
        config.sandbox.root = Some(fx.sandbox_root.path().to_path_buf());
        let h = Harness::new(config, &fx.repo, &fx.evals, &Interrupt::new()).expect("harness");
        let suites = h.load_suites("standup").expect("load");
        let report = h.run_sequential(&suites).expect("run");
        assert!(report.lines.iter().all(|l| l.status == RowStatus::Timeout && !l.passed));
        assert!(branches(&fx.repo, "eval-sandbox").is_empty());
    }

    #[test]
    fn missing_target_program_is_an_invoke_error_row() {
        let fx = fixture(&[("standup", SUITE_CSV)]);
        let mut config = HarnessConfig::default();
        config.target.command = vec!["definitely-not-a-real-target".to_string()];
        config.judge.command = sh_command(PASSING_JUDGE);
        config.sandbox.root = Some(fx.sandbox_root.path().to_path_buf());
        let h = Harness::new(config, &fx.repo, &fx.evals, &Interrupt::new()).expect("harness");
        let suites = h.load_suites("standup").expect("load");
        let report = h.run_sequential(&suites).expect("run");
        assert_eq!(report.lines[0].status, RowStatus::InvokeError);
        assert!(!report.lines[0].passed);
    }

    #[test]
    fn worker_writes_result_files_for_its_suite() {
        let fx = fixture(&[("standup", SUITE_CSV), ("review", SUITE_CSV)]);
        let h = harness(&fx, "cat", PASSING_JUDGE);
        let layout = RunLayout::create(h.results_root()).expect("layout");
        let totals = h.run_worker("review", &layout.run_dir).expect("worker");
        assert_eq!(totals.total(), 2);

        let store = ResultStore::new(&layout.results_dir());
        let results = store.read_all(&["review".to_string(), "standup".to_string()]);
        assert_eq!(results[0].1.as_ref().map(|r| r.lines.len()), Some(2));
        assert!(results[1].1.is_none());
        assert!(!h.results_root().join(LATEST_LINK).exists());
    }

    #[test]
    fn interrupted_run_records_state_and_leaves_no_branch() {
        let fx = fixture(&[("standup", SUITE_CSV)]);
        let mut config = HarnessConfig::default();
        config.target.command = sh_command("sleep 30");
        config.judge.command = sh_command(PASSING_JUDGE);
        config.sandbox.root = Some(fx.sandbox_root.path().to_path_buf());
        let interrupt = Interrupt::new();
        let h = Harness::new(config, &fx.repo, &fx.evals, &interrupt).expect("harness");
        let suites = h.load_suites("standup").expect("load");
        let trigger = interrupt.clone();
        let timer = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(500));
            trigger.trigger();
        });

        let err = h.run_sequential(&suites).expect_err("interrupted");
        timer.join().expect("timer");
        assert!(is_interrupted(&err));
        assert!(branches(&fx.repo, "eval-sandbox").is_empty());

        let run_dir = fs::read_dir(h.results_root())
            .expect("results root")
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.is_dir())
            .expect("run dir");
        let state: RunState = serde_json::from_slice(
            &fs::read(run_dir.join(RUN_STATE_FILE)).expect("read state"),
        )
        .expect("parse state");
        assert_eq!(state.status, RunStatus::Interrupted);
        assert!(!h.results_root().join(LATEST_LINK).exists());
    }

    #[test]
    fn dry_listing_has_one_line_per_case() {
        let fx = fixture(&[("standup", SUITE_CSV), ("review", SUITE_CSV)]);
        let h = harness(&fx, "cat", PASSING_JUDGE);
        let suites = h.load_suites("all").expect("load");
        let listing = dry_run_listing(&suites);
        let entries: Vec<&str> = listing
            .lines()
            .filter(|l| l.starts_with("review") || l.starts_with("standup"))
            .collect();
        assert_eq!(entries.len(), 4);
        assert!(entries[0].starts_with("review  s1  trigger  Summarize yesterday, briefly"));
        assert!(listing.contains("4 cases in 2 suites"));
        assert!(!h.results_root().exists());
    }

    #[test]
    fn run_layout_ids_do_not_collide() {
        let root = tempfile::tempdir().expect("tempdir");
        let first = RunLayout::create(root.path()).expect("first");
        let second = RunLayout::create(root.path()).expect("second");
        assert_ne!(first.run_dir, second.run_dir);
        assert!(first.run_id.starts_with("run_"));
        let reopened = RunLayout::open(&second.run_dir).expect("open");
        assert_eq!(reopened.run_id, second.run_id);
        assert_eq!(reopened.results_dir(), second.run_dir.join(".results"));
    }
}
