//! Fatal precondition checks, run before any sandbox is touched.

use crate::interrupt::Interrupt;
use crate::process::{run_command, CommandSpec};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PreconditionError {
    #[error("required tool `{tool}` ({role}) was not found on PATH")]
    MissingTool { tool: String, role: &'static str },
    #[error("{} is not inside a git repository", path.display())]
    NotARepository { path: PathBuf },
}

/// A program the run cannot proceed without, and what it is for.
#[derive(Debug, Clone, Copy)]
pub struct RequiredTool<'a> {
    pub program: &'a str,
    pub role: &'static str,
}

/// Resolve every tool on `PATH`. A program given as a path is checked
/// directly. Fails on the first missing tool.
pub fn check_required_tools(tools: &[RequiredTool<'_>]) -> Result<(), PreconditionError> {
    for tool in tools {
        match which::which(tool.program) {
            Ok(resolved) => debug!(
                tool = tool.program,
                role = tool.role,
                path = %resolved.display(),
                "tool resolved"
            ),
            Err(_) => {
                return Err(PreconditionError::MissingTool {
                    tool: tool.program.to_string(),
                    role: tool.role,
                })
            }
        }
    }
    Ok(())
}

/// `git` plus the target and judge programs.
pub fn harness_tools<'a>(target_program: &'a str, judge_program: &'a str) -> Vec<RequiredTool<'a>> {
    vec![
        RequiredTool {
            program: "git",
            role: "sandbox",
        },
        RequiredTool {
            program: target_program,
            role: "target",
        },
        RequiredTool {
            program: judge_program,
            role: "judge",
        },
    ]
}

/// Top level of the git checkout containing `start`.
pub fn resolve_repo_root(start: &Path) -> Result<PathBuf, PreconditionError> {
    let not_a_repo = || PreconditionError::NotARepository {
        path: start.to_path_buf(),
    };
    let spec = CommandSpec::new("git", start)
        .args(["rev-parse", "--show-toplevel"])
        .timeout(Some(Duration::from_secs(30)));
    let outcome = run_command(&spec, &Interrupt::new()).map_err(|_| not_a_repo())?;
    let top = outcome.stdout.trim();
    if !outcome.success() || top.is_empty() {
        return Err(not_a_repo());
    }
    Ok(PathBuf::from(top))
}
