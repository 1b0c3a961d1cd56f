// Out-of-process script runner
#![allow(dead_code)]

use crate::sandbox::config::SandboxConfig;
use crate::sandbox::types::{CapturedRun, TIMEOUT_EXIT_CODE};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const TRUNCATION_NOTICE: &str = "\n[output truncated]";

/// Executes scripts in child processes
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Run `script` with the configured interpreter
    async fn run(&self, script: &str, timeout: Duration) -> CapturedRun;

    /// Run `script` through another program, e.g. a linter
    async fn run_program(
        &self,
        program: &str,
        args: &[String],
        script: &str,
        timeout: Duration,
    ) -> CapturedRun;
}

/// Runner backed by real OS processes.
///
/// Every call writes the script to its own temp file, spawns the program in
/// a fresh process group with piped output and races it against the
/// timeout. The temp file is removed when the call returns, whichever path
/// it takes.
pub struct ProcessRunner {
    interpreter: String,
    interpreter_args: Vec<String>,
    kill_grace: Duration,
    max_output_bytes: usize,
    temp_dir: Option<PathBuf>,
    script_label: String,
}

impl ProcessRunner {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            interpreter_args: config.interpreter_args.clone(),
            kill_grace: config.kill_grace(),
            max_output_bytes: config.max_output_bytes,
            temp_dir: config.temp_dir.clone(),
            script_label: config.script_label.clone(),
        }
    }

    fn write_artifact(&self, script: &str) -> std::io::Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("pybox-").suffix(".py");

        let mut file = match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(script.as_bytes())?;
        file.flush()?;
        Ok(file)
    }

    async fn execute(
        &self,
        program: &str,
        args: &[String],
        script: &str,
        timeout: Duration,
    ) -> CapturedRun {
        let start = Instant::now();

        let artifact = match self.write_artifact(script) {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!(error = %e, "failed to write script artifact");
                return CapturedRun::transport(format!("failed to write script artifact: {e}"));
            }
        };
        let artifact_path = artifact.path().to_string_lossy().into_owned();

        debug!(
            program = %program,
            artifact = %artifact_path,
            timeout_ms = timeout.as_millis() as u64,
            script_bytes = script.len(),
            "spawning script"
        );

        let mut command = Command::new(program);
        command
            .args(args)
            .arg(artifact.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .env("PATH", search_path())
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .kill_on_drop(true)
            .process_group(0);
        if let Some(dir) = artifact.path().parent() {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %program, error = %e, "failed to spawn process");
                return CapturedRun::transport(format!("failed to start `{program}`: {e}"));
            }
        };
        let pid = child.id();

        let mut stdout_reader = tokio::spawn(drain(child.stdout.take(), self.max_output_bytes));
        let mut stderr_reader = tokio::spawn(drain(child.stderr.take(), self.max_output_bytes));

        let waited = tokio::time::timeout(timeout, child.wait()).await;
        let (exit_code, timed_out) = match waited {
            Ok(Ok(status)) => {
                // Leftover background children must not outlive the run
                kill_group(pid);
                (exit_code_of(status), false)
            }
            Ok(Err(e)) => {
                self.terminate(&mut child, pid).await;
                stdout_reader.abort();
                stderr_reader.abort();
                return CapturedRun::transport(format!("failed to wait for `{program}`: {e}"));
            }
            Err(_) => {
                info!(
                    pid = pid.unwrap_or_default(),
                    timeout_ms = timeout.as_millis() as u64,
                    "script exceeded timeout, killing"
                );
                self.terminate(&mut child, pid).await;
                (TIMEOUT_EXIT_CODE, true)
            }
        };

        let stdout = self.collect(&mut stdout_reader, &artifact_path).await;
        let stderr = self.collect(&mut stderr_reader, &artifact_path).await;

        if let Err(e) = artifact.close() {
            warn!(artifact = %artifact_path, error = %e, "failed to remove script artifact");
        }

        info!(
            program = %program,
            duration_ms = start.elapsed().as_millis() as u64,
            exit_code = exit_code,
            timed_out = timed_out,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            "script finished"
        );

        CapturedRun {
            stdout,
            stderr,
            exit_code,
            timed_out,
            transport_error: None,
        }
    }

    /// SIGKILL the whole group, then wait at most `kill_grace` for the reap
    async fn terminate(&self, child: &mut Child, pid: Option<u32>) {
        kill_group(pid);
        if let Err(e) = child.start_kill() {
            debug!(error = %e, "start_kill after group kill");
        }

        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(Ok(status)) => debug!(status = %status, "killed process reaped"),
            Ok(Err(e)) => warn!(error = %e, "failed to reap killed process"),
            Err(_) => warn!(
                grace_ms = self.kill_grace.as_millis() as u64,
                "killed process not reaped within grace period"
            ),
        }
    }

    /// Join a stream reader within the grace period and render its text
    async fn collect(&self, reader: &mut JoinHandle<Drained>, artifact_path: &str) -> String {
        let drained = match tokio::time::timeout(self.kill_grace, &mut *reader).await {
            Ok(Ok(drained)) => drained,
            Ok(Err(e)) => {
                warn!(error = %e, "output reader task failed");
                Drained::default()
            }
            Err(_) => {
                // A detached grandchild still holds the pipe open
                warn!("output reader did not finish within grace period");
                reader.abort();
                Drained::default()
            }
        };

        let mut text = String::from_utf8_lossy(&drained.bytes).into_owned();
        if !artifact_path.is_empty() {
            text = text.replace(artifact_path, &self.script_label);
        }
        if drained.truncated {
            text.push_str(TRUNCATION_NOTICE);
        }
        text
    }
}

#[async_trait]
impl ScriptRunner for ProcessRunner {
    async fn run(&self, script: &str, timeout: Duration) -> CapturedRun {
        self.execute(&self.interpreter, &self.interpreter_args, script, timeout)
            .await
    }

    async fn run_program(
        &self,
        program: &str,
        args: &[String],
        script: &str,
        timeout: Duration,
    ) -> CapturedRun {
        self.execute(program, args, script, timeout).await
    }
}

/// Bytes read from one pipe
#[derive(Debug, Default)]
struct Drained {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Read a pipe to EOF, keeping at most `limit` bytes
async fn drain<R: AsyncRead + Unpin>(reader: Option<R>, limit: usize) -> Drained {
    let mut drained = Drained::default();
    let Some(mut reader) = reader else {
        return drained;
    };

    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(drained.bytes.len());
                if n > room {
                    drained.truncated = true;
                }
                drained.bytes.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) => {
                debug!(error = %e, "pipe read failed");
                break;
            }
        }
    }
    drained
}

fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => debug!(pgid = pid, "killed process group"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid = pid, error = %e, "failed to kill process group"),
    }
}

/// Exit code, or `-N` when terminated by signal N
fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| -s))
        .unwrap_or(TIMEOUT_EXIT_CODE)
}

fn search_path() -> String {
    std::env::var("PATH").unwrap_or_else(|_| FALLBACK_PATH.to_string())
}
