use crate::fsutil::{atomic_write_bytes, sanitize_component};
use crate::interrupt::Interrupt;
use crate::process::{run_command, CommandSpec};
use crate::template::{CommandTemplate, Vars};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationStatus {
    Ok,
    /// Still graded: a target may exit non-zero with usable partial output.
    ErrorExit { code: Option<i32> },
    Timeout,
}

impl InvocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationStatus::Ok => "OK",
            InvocationStatus::ErrorExit { .. } => "ERROR_EXIT",
            InvocationStatus::Timeout => "TIMEOUT",
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub output: String,
    pub status: InvocationStatus,
    pub duration: Duration,
}

pub struct InvocationRequest<'a> {
    pub suite: &'a str,
    pub case_id: &'a str,
    pub prompt: &'a str,
    pub model: &'a str,
}

impl InvocationRequest<'_> {
    fn vars(&self) -> Vars {
        let mut vars = Vars::new();
        vars.insert("model", self.model.to_string());
        vars.insert("suite", self.suite.to_string());
        vars.insert("case", self.case_id.to_string());
        vars
    }
}

/// Runs one configured command template with a bounded timeout.
#[derive(Debug, Clone)]
pub struct Invoker {
    command: CommandTemplate,
    timeout: Option<Duration>,
    interrupt: Interrupt,
}

impl Invoker {
    pub fn new(command: CommandTemplate, timeout: Option<Duration>, interrupt: Interrupt) -> Self {
        Self {
            command,
            timeout,
            interrupt,
        }
    }

    pub fn program(&self) -> &str {
        self.command.program()
    }

    /// Feed `request.prompt` on stdin with `cwd` as working directory.
    /// Errors only on spawn failure or interrupt; exit codes and timeouts are
    /// reported through [`InvocationStatus`].
    pub fn invoke(&self, cwd: &Path, request: &InvocationRequest<'_>) -> Result<InvocationResult> {
        let args = self.command.render_args(&request.vars())?;
        let spec = CommandSpec::new(self.command.program(), cwd)
            .args(args)
            .env("EVAL_SUITE", request.suite)
            .env("EVAL_CASE", request.case_id)
            .stdin(request.prompt.as_bytes().to_vec())
            .timeout(self.timeout);
        debug!(suite = request.suite, case = request.case_id, command = %spec.label(), "invoking");

        let outcome = run_command(&spec, &self.interrupt)?;
        let status = if outcome.timed_out {
            InvocationStatus::Timeout
        } else if outcome.success() {
            InvocationStatus::Ok
        } else {
            InvocationStatus::ErrorExit {
                code: outcome.status.and_then(|s| s.code()),
            }
        };
        Ok(InvocationResult {
            output: outcome.combined_output(),
            status,
            duration: outcome.duration,
        })
    }
}

pub fn output_artifact_path(suite_dir: &Path, case_id: &str) -> PathBuf {
    suite_dir.join(format!("{}.output.txt", sanitize_component(case_id)))
}

/// Run one test case inside the sandbox and persist its raw output, which is
/// the only artifact an invocation produces.
pub fn invoke_case(
    invoker: &Invoker,
    sandbox_path: &Path,
    suite_dir: &Path,
    request: &InvocationRequest<'_>,
) -> Result<InvocationResult> {
    let result = invoker.invoke(sandbox_path, request)?;
    match result.status {
        InvocationStatus::Timeout => warn!(
            suite = request.suite,
            case = request.case_id,
            elapsed_ms = result.duration.as_millis() as u64,
            "invocation timed out"
        ),
        status => info!(
            suite = request.suite,
            case = request.case_id,
            status = status.as_str(),
            elapsed_ms = result.duration.as_millis() as u64,
            "invocation finished"
        ),
    }
    let path = output_artifact_path(suite_dir, request.case_id);
    atomic_write_bytes(&path, result.output.as_bytes())
        .with_context(|| format!("failed to write raw output for case {}", request.case_id))?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sh_invoker(script: &str, timeout: Option<Duration>) -> Invoker {
        let argv: Vec<String> = vec!["sh".into(), "-c".into(), script.into(), "{{model}}".into()];
        Invoker::new(
            CommandTemplate::parse(&argv).expect("template"),
            timeout,
            Interrupt::new(),
        )
    }

    fn request<'a>(prompt: &'a str) -> InvocationRequest<'a> {
        InvocationRequest {
            suite: "standup",
            case_id: "s1",
            prompt,
            model: "sonnet",
        }
    }

    #[test]
    fn prompt_goes_to_stdin_and_model_to_args() {
        let dir = tempfile::tempdir().expect("tempdir");
        let invoker = sh_invoker("echo \"model=$0 suite=$EVAL_SUITE\"; cat", None);
        let result = invoker
            .invoke(dir.path(), &request("hello, world"))
            .expect("invoke");
        assert_eq!(result.status, InvocationStatus::Ok);
        assert_eq!(result.output, "model=sonnet suite=standup\nhello, world");
    }

    #[test]
    fn nonzero_exit_is_error_exit_with_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let invoker = sh_invoker("echo partial; exit 4", None);
        let result = invoker.invoke(dir.path(), &request("x")).expect("invoke");
        assert_eq!(result.status, InvocationStatus::ErrorExit { code: Some(4) });
        assert_eq!(result.output.trim(), "partial");
    }

    #[test]
    fn timeout_is_tagged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let invoker = sh_invoker("sleep 20", Some(Duration::from_millis(200)));
        let result = invoker.invoke(dir.path(), &request("x")).expect("invoke");
        assert_eq!(result.status, InvocationStatus::Timeout);
    }

    #[test]
    fn invoke_case_writes_exactly_one_artifact() {
        let sandbox = tempfile::tempdir().expect("sandbox");
        let suite_dir = tempfile::tempdir().expect("suite dir");
        let invoker = sh_invoker("pwd", None);
        let result = invoke_case(&invoker, sandbox.path(), suite_dir.path(), &request("x"))
            .expect("invoke");

        let files: Vec<_> = fs::read_dir(suite_dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(files, vec!["s1.output.txt".to_string()]);
        let saved = fs::read_to_string(output_artifact_path(suite_dir.path(), "s1")).expect("read");
        assert_eq!(saved, result.output);
        let cwd = fs::canonicalize(sandbox.path()).expect("canonical");
        assert_eq!(saved.trim(), cwd.to_string_lossy());
    }

    #[test]
    fn status_serializes_with_kind_tag() {
        let json =
            serde_json::to_value(InvocationStatus::ErrorExit { code: Some(2) }).expect("json");
        assert_eq!(json["kind"], "ERROR_EXIT");
        assert_eq!(json["code"], 2);
    }
}
