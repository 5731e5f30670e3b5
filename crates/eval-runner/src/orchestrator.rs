//! Parallel orchestration: one worker process per suite, bounded by `max`.
//!
//! Workers only ever communicate through the [`ResultStore`]. The parent
//! never reads a worker's pipes; each worker writes its own log file.

use crate::config::Schedule;
use crate::fsutil::{ensure_dir, sanitize_component};
use crate::interrupt::{Interrupt, InterruptedError};
use crate::process::kill_process_group;
use crate::report::SummaryLine;
use crate::results::ResultStore;
use crate::sandbox::{SandboxManager, ScopeId};
use anyhow::{anyhow, Context, Result};
use nix::sys::signal::Signal;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Consecutive chunks of at most `max` suites, in input order.
pub fn plan_batches(suites: &[String], max: usize) -> Vec<Vec<String>> {
    suites.chunks(max.max(1)).map(<[String]>::to_vec).collect()
}

/// Starts the worker process for one suite.
pub trait WorkerSpawner {
    fn spawn(&self, suite: &str) -> Result<Child>;
    fn log_path(&self, suite: &str) -> PathBuf;
}

/// Re-executes the current binary in worker mode.
#[derive(Debug, Clone)]
pub struct SelfExecSpawner {
    exe: PathBuf,
    /// Flags forwarded so the worker resolves the same configuration.
    forwarded_args: Vec<String>,
    run_dir: PathBuf,
    logs_dir: PathBuf,
}

impl SelfExecSpawner {
    pub fn new(forwarded_args: Vec<String>, run_dir: &Path, logs_dir: &Path) -> Result<Self> {
        let exe = std::env::current_exe().context("failed to locate the running executable")?;
        Ok(Self::with_exe(exe, forwarded_args, run_dir, logs_dir))
    }

    pub fn with_exe(
        exe: PathBuf,
        forwarded_args: Vec<String>,
        run_dir: &Path,
        logs_dir: &Path,
    ) -> Self {
        Self {
            exe,
            forwarded_args,
            run_dir: run_dir.to_path_buf(),
            logs_dir: logs_dir.to_path_buf(),
        }
    }
}

impl WorkerSpawner for SelfExecSpawner {
    fn spawn(&self, suite: &str) -> Result<Child> {
        ensure_dir(&self.logs_dir)?;
        let log_path = self.log_path(suite);
        let log = File::create(&log_path)
            .with_context(|| format!("failed to create worker log {}", log_path.display()))?;
        let log_err = log.try_clone()?;
        Command::new(&self.exe)
            .args(&self.forwarded_args)
            .arg("--worker-suite")
            .arg(suite)
            .arg("--run-dir")
            .arg(&self.run_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .spawn()
            .with_context(|| format!("failed to spawn worker for suite {}", suite))
    }

    fn log_path(&self, suite: &str) -> PathBuf {
        self.logs_dir.join(format!("{}.log", sanitize_component(suite)))
    }
}

#[derive(Debug, Clone)]
pub struct ParallelOptions {
    pub max: usize,
    pub schedule: Schedule,
    /// How long terminated workers get to tear down before SIGKILL.
    pub terminate_grace: Duration,
}

impl ParallelOptions {
    pub fn new(max: usize, schedule: Schedule) -> Self {
        Self {
            max: max.max(1),
            schedule,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        }
    }
}

#[derive(Debug)]
pub struct ParallelOutcome {
    /// Suite order, crashed suites replaced by a synthetic line.
    pub lines: Vec<SummaryLine>,
    pub crashed: Vec<String>,
    /// Suites started together; one entry per batch (batched) or per spawn
    /// wave (pool).
    pub waves: Vec<Vec<String>>,
    pub peak_live: usize,
}

struct LiveWorker {
    suite: String,
    child: Child,
}

impl LiveWorker {
    fn scope(&self) -> ScopeId {
        ScopeId::new(self.child.id(), Some(&self.suite))
    }
}

struct Orchestrator<'a> {
    options: &'a ParallelOptions,
    spawner: &'a dyn WorkerSpawner,
    sandboxes: &'a SandboxManager,
    interrupt: &'a Interrupt,
    live: Vec<LiveWorker>,
    waves: Vec<Vec<String>>,
    peak_live: usize,
}

impl Orchestrator<'_> {
    fn start_wave(&mut self, suites: Vec<String>) {
        for suite in &suites {
            match self.spawner.spawn(suite) {
                Ok(child) => {
                    info!(suite = %suite, pid = child.id(), "worker started");
                    self.live.push(LiveWorker {
                        suite: suite.clone(),
                        child,
                    });
                }
                Err(err) => {
                    error!(suite = %suite, %err, "worker failed to start");
                    note_in_log(&self.spawner.log_path(suite), &format!("{:#}", err));
                }
            }
        }
        self.peak_live = self.peak_live.max(self.live.len());
        self.waves.push(suites);
    }

    /// Collect workers that have exited. Returns an error once the interrupt
    /// fires, after every live worker has been torn down.
    fn reap(&mut self) -> Result<()> {
        if self.interrupt.is_triggered() {
            self.terminate_all();
            return Err(InterruptedError.into());
        }
        let mut still_running = Vec::with_capacity(self.live.len());
        for mut worker in self.live.drain(..) {
            match worker.child.try_wait() {
                Ok(Some(status)) if status.success() => {
                    info!(suite = %worker.suite, "worker finished");
                }
                Ok(Some(status)) => {
                    warn!(suite = %worker.suite, %status, "worker exited abnormally");
                    release_quietly(self.sandboxes, &worker.scope());
                }
                Ok(None) => still_running.push(worker),
                Err(err) => {
                    warn!(suite = %worker.suite, %err, "lost track of worker");
                    release_quietly(self.sandboxes, &worker.scope());
                }
            }
        }
        self.live = still_running;
        Ok(())
    }

    fn wait_until(&mut self, done: impl Fn(&Self) -> bool) -> Result<()> {
        loop {
            self.reap()?;
            if done(self) {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// SIGTERM every live worker group, wait out the grace period, SIGKILL
    /// what is left, then release each worker's sandbox on its behalf.
    fn terminate_all(&mut self) {
        if self.live.is_empty() {
            return;
        }
        warn!(workers = self.live.len(), "terminating live workers");
        for worker in &self.live {
            kill_process_group(worker.child.id(), Signal::SIGTERM);
        }
        let deadline = Instant::now() + self.options.terminate_grace;
        while Instant::now() < deadline {
            let all_exited = self
                .live
                .iter_mut()
                .all(|w| matches!(w.child.try_wait(), Ok(Some(_))));
            if all_exited {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
        for mut worker in self.live.drain(..) {
            if !matches!(worker.child.try_wait(), Ok(Some(_))) {
                warn!(suite = %worker.suite, "worker ignored SIGTERM, killing");
                kill_process_group(worker.child.id(), Signal::SIGKILL);
                let _ = worker.child.kill();
            }
            let _ = worker.child.wait();
            release_quietly(self.sandboxes, &worker.scope());
        }
    }
}

impl Drop for Orchestrator<'_> {
    fn drop(&mut self) {
        self.terminate_all();
    }
}

fn release_quietly(sandboxes: &SandboxManager, scope: &ScopeId) {
    if let Err(err) = sandboxes.release_scope(scope) {
        warn!(pid = scope.pid, %err, "failed to release worker sandbox");
    }
}

fn note_in_log(path: &Path, message: &str) {
    let written = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{}", message));
    if let Err(err) = written {
        warn!(path = %path.display(), %err, "failed to write worker log");
    }
}

/// Run one worker per suite with at most `options.max` alive at any time,
/// then gather results in suite order.
pub fn run_parallel(
    suites: &[String],
    options: &ParallelOptions,
    spawner: &dyn WorkerSpawner,
    store: &ResultStore,
    sandboxes: &SandboxManager,
    interrupt: &Interrupt,
) -> Result<ParallelOutcome> {
    if options.max == 0 {
        return Err(anyhow!("parallel ceiling must be at least 1"));
    }
    let mut orchestrator = Orchestrator {
        options,
        spawner,
        sandboxes,
        interrupt,
        live: Vec::new(),
        waves: Vec::new(),
        peak_live: 0,
    };

    match options.schedule {
        Schedule::Batched => {
            let batches = plan_batches(suites, options.max);
            let count = batches.len();
            for (index, batch) in batches.into_iter().enumerate() {
                orchestrator.reap()?;
                info!(batch = index + 1, of = count, suites = ?batch, "starting batch");
                orchestrator.start_wave(batch);
                orchestrator.wait_until(|o| o.live.is_empty())?;
            }
        }
        Schedule::Pool => {
            let mut pending: VecDeque<String> = suites.iter().cloned().collect();
            while !pending.is_empty() {
                orchestrator.reap()?;
                let free = options.max - orchestrator.live.len();
                let wave: Vec<String> = (0..free).filter_map(|_| pending.pop_front()).collect();
                if !wave.is_empty() {
                    orchestrator.start_wave(wave);
                }
                if !pending.is_empty() {
                    orchestrator.wait_until(|o| o.live.len() < o.options.max)?;
                }
            }
            orchestrator.wait_until(|o| o.live.is_empty())?;
        }
    }

    let mut lines = Vec::new();
    let mut crashed = Vec::new();
    for (suite, result) in store.read_all(suites) {
        match result {
            Some(result) => lines.extend(result.lines),
            None => {
                let log = spawner.log_path(&suite);
                error!(suite = %suite, log = %log.display(), "suite produced no results");
                lines.push(SummaryLine::crashed(&suite, &log));
                crashed.push(suite);
            }
        }
    }

    Ok(ParallelOutcome {
        lines,
        crashed,
        waves: std::mem::take(&mut orchestrator.waves),
        peak_live: orchestrator.peak_live,
    })
}
