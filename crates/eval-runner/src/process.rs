use crate::interrupt::{Interrupt, InterruptedError};
use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io::{BufReader, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long readers may keep draining once the group has been killed.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
    /// `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl AsRef<Path>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.as_ref().to_path_buf(),
            env: Vec::new(),
            stdin: None,
            timeout: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn label(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug)]
pub struct CommandOutcome {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.map(|s| s.success()).unwrap_or(false)
    }

    /// stdout followed by stderr, as one blob.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => {
                let sep = if self.stdout.ends_with('\n') { "" } else { "\n" };
                format!("{}{}{}", self.stdout, sep, self.stderr)
            }
        }
    }
}

/// Run `spec` in its own process group, capturing stdout and stderr.
///
/// On timeout the whole group is killed and the outcome is returned with
/// `timed_out` set. If `interrupt` fires while waiting, the group is killed
/// and `InterruptedError` is returned. Once the leader exits, anything it
/// left running in its group is killed too, so background children cannot
/// hold the output pipes open past the call.
pub fn run_command(spec: &CommandSpec, interrupt: &Interrupt) -> Result<CommandOutcome> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    let start = Instant::now();
    let mut child = command
        .spawn()
        .with_context(|| format!("failed to start `{}`", spec.label()))?;
    let pid = child.id();
    debug!(pid, command = %spec.label(), "spawned");

    let stdin_handle = match (child.stdin.take(), spec.stdin.clone()) {
        (Some(mut pipe), Some(bytes)) => Some(thread::spawn(move || {
            let _ = pipe.write_all(&bytes);
        })),
        _ => None,
    };
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("failed to capture stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("failed to capture stderr"))?;
    let stdout_reader = Reader::spawn(stdout);
    let stderr_reader = Reader::spawn(stderr);

    let mut timed_out = false;
    let mut interrupted = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                let expired = spec.timeout.map(|t| start.elapsed() >= t).unwrap_or(false);
                if expired || interrupt.is_triggered() {
                    timed_out = expired;
                    interrupted = !expired;
                    kill_process_group(pid, Signal::SIGKILL);
                    let _ = child.kill();
                    break child.wait().ok();
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                kill_process_group(pid, Signal::SIGKILL);
                return Err(anyhow!("failed to wait for `{}`: {}", spec.label(), e));
            }
        }
    };

    kill_process_group(pid, Signal::SIGKILL);
    let drain_deadline = Instant::now() + DRAIN_GRACE;
    if let Some(handle) = stdin_handle {
        if wait_finished(&handle, drain_deadline) {
            let _ = handle.join();
        }
    }
    let stdout_bytes = stdout_reader.finish(drain_deadline);
    let stderr_bytes = stderr_reader.finish(drain_deadline);

    if interrupted {
        return Err(InterruptedError.into());
    }

    Ok(CommandOutcome {
        status,
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        timed_out,
        duration: start.elapsed(),
    })
}

/// Signal every process in the group led by `pid`. Errors (typically ESRCH,
/// the group is already gone) are ignored.
pub fn kill_process_group(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let _ = killpg(Pid::from_raw(raw), signal);
}

/// Probe whether `pid` still exists (signal 0).
pub fn pid_is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    nix::sys::signal::kill(Pid::from_raw(raw), None).is_ok()
}

/// Pipe reader that accumulates into a shared buffer, so whatever arrived
/// can be collected even if the writer never closes its end.
struct Reader {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<()>,
}

impl Reader {
    fn spawn<R: Read + Send + 'static>(source: R) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let handle = thread::spawn(move || {
            let mut reader = BufReader::new(source);
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Ok(mut out) = sink.lock() {
                            out.extend_from_slice(&chunk[..n]);
                        }
                    }
                }
            }
        });
        Self { buf, handle }
    }

    fn finish(self, deadline: Instant) -> Vec<u8> {
        if wait_finished(&self.handle, deadline) {
            let _ = self.handle.join();
        } else {
            debug!("output pipe still open after drain grace; abandoning reader");
        }
        let bytes = self.buf.lock().map(|b| b.clone()).unwrap_or_default();
        bytes
    }
}

fn wait_finished<T>(handle: &JoinHandle<T>, deadline: Instant) -> bool {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", std::env::temp_dir()).args(["-c", script])
    }

    #[test]
    fn captures_stdout_stderr_and_stdin() {
        let spec = sh("cat; echo oops >&2; exit 3").stdin("hello\n");
        let outcome = run_command(&spec, &Interrupt::new()).expect("run");
        assert_eq!(outcome.stdout, "hello\n");
        assert_eq!(outcome.stderr, "oops\n");
        assert_eq!(outcome.status.and_then(|s| s.code()), Some(3));
        assert!(!outcome.timed_out);
        assert_eq!(outcome.combined_output(), "hello\noops\n");
    }

    #[test]
    fn timeout_kills_the_whole_group() {
        let spec = sh("sleep 30 & sleep 30; echo done").timeout(Some(Duration::from_millis(300)));
        let start = Instant::now();
        let outcome = run_command(&spec, &Interrupt::new()).expect("run");
        assert!(outcome.timed_out);
        assert!(!outcome.success());
        assert!(!outcome.stdout.contains("done"));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn background_child_cannot_outlive_the_call() {
        let spec = sh("sleep 8 & echo started").timeout(Some(Duration::from_secs(1)));
        let start = Instant::now();
        let outcome = run_command(&spec, &Interrupt::new()).expect("run");
        assert!(
            start.elapsed() < Duration::from_secs(4),
            "returned after {:?}",
            start.elapsed()
        );
        assert_eq!(outcome.stdout, "started\n");
        assert!(outcome.success());
    }

    #[test]
    fn no_timeout_waits_for_completion() {
        let spec = sh("sleep 0.2; echo finished").timeout(None);
        let outcome = run_command(&spec, &Interrupt::new()).expect("run");
        assert!(outcome.success());
        assert_eq!(outcome.stdout.trim(), "finished");
    }

    #[test]
    fn interrupt_returns_interrupted_error() {
        let interrupt = Interrupt::new();
        interrupt.trigger();
        let err = run_command(&sh("sleep 30"), &interrupt).expect_err("must be interrupted");
        assert!(crate::interrupt::is_interrupted(&err));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let spec = CommandSpec::new("definitely-not-a-real-binary-xyz", std::env::temp_dir());
        let err = run_command(&spec, &Interrupt::new()).expect_err("spawn must fail");
        assert!(err.to_string().contains("failed to start"));
    }
}
