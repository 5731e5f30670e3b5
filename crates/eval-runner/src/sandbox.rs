//! Disposable git worktrees bound to throwaway branches.
//!
//! Every sandbox is named after its owning scope (process id plus optional
//! suite), so concurrent runs and concurrent workers never collide. Git is
//! always driven with a bounded timeout and is never cut short by the
//! interrupt flag: teardown has to finish even while the run is unwinding.

use crate::fsutil::{ensure_dir, sanitize_component};
use crate::interrupt::Interrupt;
use crate::process::{pid_is_alive, run_command, CommandSpec};
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DEFAULT_BRANCH_PREFIX: &str = "eval-sandbox";
const SANDBOX_ROOT_DIR: &str = "eval-sandbox";
const GIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Identity of the component that owns a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeId {
    pub pid: u32,
    pub suite: Option<String>,
}

impl ScopeId {
    pub fn new(pid: u32, suite: Option<&str>) -> Self {
        Self {
            pid,
            suite: suite.map(str::to_string),
        }
    }

    pub fn current(suite: Option<&str>) -> Self {
        Self::new(std::process::id(), suite)
    }

    fn fragment(&self) -> String {
        match &self.suite {
            Some(suite) => format!("{}-{}", self.pid, sanitize_component(suite)),
            None => self.pid.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    pub scope: ScopeId,
    pub branch: String,
    pub path: PathBuf,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: Vec<String>,
    pub skipped_live: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SandboxManager {
    repo_root: PathBuf,
    sandbox_root: PathBuf,
    branch_prefix: String,
}

#[derive(Debug)]
struct WorktreeEntry {
    path: PathBuf,
    branch: Option<String>,
}

impl SandboxManager {
    pub fn new(repo_root: &Path, sandbox_root: &Path, branch_prefix: &str) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            sandbox_root: sandbox_root.to_path_buf(),
            branch_prefix: branch_prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Sandboxes under `$TMPDIR/eval-sandbox/`.
    pub fn with_default_root(repo_root: &Path, branch_prefix: &str) -> Self {
        Self::new(
            repo_root,
            &std::env::temp_dir().join(SANDBOX_ROOT_DIR),
            branch_prefix,
        )
    }

    pub fn sandbox_for(&self, scope: &ScopeId) -> Sandbox {
        Sandbox {
            scope: scope.clone(),
            branch: format!("{}/{}", self.branch_prefix, scope.fragment()),
            path: self.sandbox_root.join(scope.fragment()),
        }
    }

    /// Create the worktree and branch for `scope`.
    ///
    /// A leftover branch of the same name (a crashed run whose pid was
    /// recycled) is force-deleted and the checkout retried once, unless a live
    /// worktree still has it checked out.
    pub fn acquire(&self, scope: &ScopeId) -> Result<Sandbox> {
        let sandbox = self.sandbox_for(scope);
        ensure_dir(&self.sandbox_root)?;
        let _ = self.git(&["worktree", "prune"]);
        if sandbox.path.exists() {
            warn!(path = %sandbox.path.display(), "clearing leftover sandbox directory");
            self.remove_worktree(&sandbox.path);
        }

        if let Err(first) = self.add_worktree(&sandbox) {
            if !self.branch_exists(&sandbox.branch)? {
                return Err(first);
            }
            let attached = self
                .worktrees()?
                .into_iter()
                .any(|wt| wt.branch.as_deref() == Some(sandbox.branch.as_str()));
            if attached {
                return Err(first.context(format!(
                    "sandbox branch {} is still checked out by another worktree",
                    sandbox.branch
                )));
            }
            warn!(branch = %sandbox.branch, "deleting stale sandbox branch and retrying");
            self.git(&["branch", "-D", &sandbox.branch])?;
            self.add_worktree(&sandbox).with_context(|| {
                format!("retry after deleting stale branch {} failed", sandbox.branch)
            })?;
        }

        info!(branch = %sandbox.branch, path = %sandbox.path.display(), "sandbox acquired");
        Ok(sandbox)
    }

    /// Remove the worktree and delete the branch. Safe to call repeatedly.
    pub fn release(&self, sandbox: &Sandbox) -> Result<()> {
        if sandbox.path.exists() {
            self.remove_worktree(&sandbox.path);
        }
        let _ = self.git(&["worktree", "prune"]);
        if self.branch_exists(&sandbox.branch)? {
            self.git(&["branch", "-D", &sandbox.branch])
                .with_context(|| format!("failed to delete sandbox branch {}", sandbox.branch))?;
        }
        if sandbox.path.exists() {
            return Err(anyhow!(
                "sandbox checkout {} survived teardown",
                sandbox.path.display()
            ));
        }
        debug!(branch = %sandbox.branch, "sandbox released");
        Ok(())
    }

    /// Best-effort release of a sandbox owned by another (terminated) process.
    pub fn release_scope(&self, scope: &ScopeId) -> Result<()> {
        self.release(&self.sandbox_for(scope))
    }

    /// Delete sandbox branches left behind by earlier runs. Only safe at the top
    /// level of a run: branches owned by a live process are left alone, which
    /// covers sibling runs, but not this run's own workers.
    pub fn sweep_stale(&self) -> Result<SweepReport> {
        let _ = self.git(&["worktree", "prune"]);
        let worktrees = self.worktrees()?;
        let owned_root = self
            .sandbox_root
            .canonicalize()
            .unwrap_or_else(|_| self.sandbox_root.clone());
        let mut report = SweepReport::default();

        for branch in self.harness_branches()? {
            let owner_alive = self.owner_pid(&branch).map(pid_is_alive).unwrap_or(false);
            let checkout = worktrees
                .iter()
                .find(|wt| wt.branch.as_deref() == Some(branch.as_str()));
            if let Some(wt) = checkout {
                let ours =
                    wt.path.starts_with(&owned_root) || wt.path.starts_with(&self.sandbox_root);
                if owner_alive || !ours {
                    report.skipped_live.push(branch);
                    continue;
                }
                warn!(path = %wt.path.display(), "removing orphaned sandbox checkout");
                self.remove_worktree(&wt.path);
                let _ = self.git(&["worktree", "prune"]);
            }
            match self.git(&["branch", "-D", &branch]) {
                Ok(_) => report.deleted.push(branch),
                Err(err) => warn!(%branch, %err, "failed to delete stale sandbox branch"),
            }
        }
        if !report.deleted.is_empty() {
            info!(count = report.deleted.len(), "swept stale sandbox branches");
        }
        Ok(report)
    }

    fn owner_pid(&self, branch: &str) -> Option<u32> {
        branch
            .strip_prefix(&self.branch_prefix)?
            .strip_prefix('/')?
            .split('-')
            .next()?
            .parse()
            .ok()
    }

    fn add_worktree(&self, sandbox: &Sandbox) -> Result<()> {
        let path = sandbox.path.to_string_lossy();
        self.git(&["worktree", "add", "-b", &sandbox.branch, &path, "HEAD"])
            .map(|_| ())
            .with_context(|| format!("failed to create sandbox checkout {}", path))
    }

    fn remove_worktree(&self, path: &Path) {
        if let Err(err) = self.git(&["worktree", "remove", "--force", &path.to_string_lossy()]) {
            debug!(%err, "git worktree remove failed, deleting directory");
        }
        if path.exists() {
            if let Err(err) = fs::remove_dir_all(path) {
                error!(path = %path.display(), %err, "failed to delete sandbox directory");
            }
        }
    }

    fn branch_exists(&self, branch: &str) -> Result<bool> {
        let refname = format!("refs/heads/{}", branch);
        let spec = self.git_spec(&["show-ref", "--verify", "--quiet", &refname]);
        let outcome = run_command(&spec, &Interrupt::new())?;
        if outcome.timed_out {
            return Err(anyhow!("git show-ref timed out"));
        }
        Ok(outcome.success())
    }

    fn harness_branches(&self) -> Result<Vec<String>> {
        let pattern = format!("refs/heads/{}/", self.branch_prefix);
        let out = self.git(&["for-each-ref", "--format=%(refname:short)", &pattern])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn worktrees(&self) -> Result<Vec<WorktreeEntry>> {
        let out = self.git(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&out))
    }

    fn git_spec(&self, args: &[&str]) -> CommandSpec {
        CommandSpec::new("git", &self.repo_root)
            .args(args.iter().copied())
            .env("GIT_TERMINAL_PROMPT", "0")
            .timeout(Some(GIT_TIMEOUT))
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let outcome = run_command(&self.git_spec(args), &Interrupt::new())?;
        if outcome.timed_out {
            return Err(anyhow!(
                "git command timed out after {}s: git {}",
                GIT_TIMEOUT.as_secs(),
                args.join(" ")
            ));
        }
        if !outcome.success() {
            return Err(anyhow!(
                "git {} failed:\nstdout:\n{}\nstderr:\n{}",
                args.join(" "),
                outcome.stdout,
                outcome.stderr
            ));
        }
        Ok(outcome.stdout)
    }
}

fn parse_worktree_list(porcelain: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;
    for line in porcelain.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(done) = current.take() {
                entries.push(done);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                branch: None,
            });
        } else if let Some(refname) = line.strip_prefix("branch ") {
            if let Some(entry) = current.as_mut() {
                entry.branch = Some(
                    refname
                        .strip_prefix("refs/heads/")
                        .unwrap_or(refname)
                        .to_string(),
                );
            }
        }
    }
    if let Some(done) = current {
        entries.push(done);
    }
    entries
}

/// Scoped acquisition: the sandbox is released when the guard drops, on every
/// exit path including `?` propagation and interrupt unwinding.
pub struct SandboxGuard<'a> {
    manager: &'a SandboxManager,
    sandbox: Option<Sandbox>,
}

impl<'a> SandboxGuard<'a> {
    pub fn acquire(manager: &'a SandboxManager, scope: &ScopeId) -> Result<Self> {
        let sandbox = manager.acquire(scope)?;
        Ok(Self {
            manager,
            sandbox: Some(sandbox),
        })
    }

    pub fn path(&self) -> &Path {
        self.sandbox
            .as_ref()
            .map(|s| s.path.as_path())
            .unwrap_or_else(|| Path::new(""))
    }

    pub fn release(mut self) -> Result<()> {
        match self.sandbox.take() {
            Some(sandbox) => self.manager.release(&sandbox),
            None => Ok(()),
        }
    }
}

impl Drop for SandboxGuard<'_> {
    fn drop(&mut self) {
        if let Some(sandbox) = self.sandbox.take() {
            if let Err(err) = self.manager.release(&sandbox) {
                error!(branch = %sandbox.branch, %err, "sandbox teardown failed");
            }
        }
    }
}
