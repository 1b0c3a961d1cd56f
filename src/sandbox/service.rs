// Sandbox service: lint, user run, bridge, test run, classify
#![allow(dead_code)]

use crate::sandbox::bridge::{CaptureManifest, bridge, compose_test_script, user_script};
use crate::sandbox::classify::{ReportPolicy, assemble};
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::error::{Result, SandboxError};
use crate::sandbox::lint::Linter;
use crate::sandbox::runner::{ProcessRunner, ScriptRunner};
use crate::sandbox::types::{CapturedRun, ExecutionReport, ExecutionRequest, Language};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

/// Entry point for executing submissions.
///
/// Holds no per-request state; concurrent `execute` calls share nothing
/// but the read-only configuration.
pub struct Sandbox {
    config: SandboxConfig,
    runner: Arc<dyn ScriptRunner>,
    linter: Linter,
}

impl Sandbox {
    /// Sandbox backed by real child processes
    pub fn new(config: SandboxConfig) -> Self {
        let runner: Arc<dyn ScriptRunner> = Arc::new(ProcessRunner::new(&config));
        Self::with_runner(config, runner)
    }

    pub fn with_runner(config: SandboxConfig, runner: Arc<dyn ScriptRunner>) -> Self {
        debug!(
            interpreter = %config.interpreter,
            default_timeout_secs = config.default_timeout_secs,
            max_timeout_secs = config.max_timeout_secs,
            lint_enabled = config.lint.enabled,
            "initializing sandbox"
        );

        let linter = Linter::new(runner.clone(), config.lint.clone());
        Self {
            config,
            runner,
            linter,
        }
    }

    /// Validate raw request fields. Runs before anything is spawned.
    pub fn prepare(
        &self,
        user_code: String,
        test_code: Option<String>,
        timeout_secs: Option<u64>,
        language: Option<&str>,
    ) -> Result<ExecutionRequest> {
        let language = match language {
            Some(name) => name.parse::<Language>()?,
            None => Language::default(),
        };

        let timeout_secs = timeout_secs.unwrap_or(self.config.default_timeout_secs);
        if timeout_secs == 0 {
            return Err(SandboxError::InvalidTimeout(timeout_secs));
        }
        if timeout_secs > self.config.max_timeout_secs {
            return Err(SandboxError::TimeoutTooLarge {
                requested: timeout_secs,
                max: self.config.max_timeout_secs,
            });
        }

        ExecutionRequest::new(
            user_code,
            test_code,
            Duration::from_secs(timeout_secs),
            language,
        )
    }

    /// Execute a request and produce its report. Never fails: every fault
    /// ends up inside the report.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionReport {
        let request_id = Uuid::new_v4();
        let span = info_span!("execution", request_id = %request_id);
        self.execute_request(request).instrument(span).await
    }

    async fn execute_request(&self, request: ExecutionRequest) -> ExecutionReport {
        info!(
            language = %request.language(),
            timeout_ms = request.timeout().as_millis() as u64,
            user_code_bytes = request.user_code().len(),
            has_test = request.test_code().is_some(),
            "execution started"
        );

        let lint = async {
            if self.linter.enabled() {
                Some(self.linter.lint(request.user_code()).await)
            } else {
                None
            }
        };
        let (lint_output, (user_run, capture)) = tokio::join!(lint, self.run_user_code(&request));

        let test_run = match request.test_code() {
            Some(test_code) if user_run.is_clean() => {
                let prelude = bridge(&user_run, &capture);
                let script = compose_test_script(&prelude, test_code, &self.config.test_label);
                Some(self.runner.run(&script, request.timeout()).await)
            }
            Some(_) => {
                debug!("user code failed, test code skipped");
                None
            }
            None => None,
        };

        let policy = ReportPolicy {
            assertion_marker: &self.config.assertion_marker,
            pass_banner: self.config.pass_banner(),
            timeout: request.timeout(),
        };
        let report = assemble(
            &user_run,
            test_run.as_ref(),
            request.test_code().is_some(),
            lint_output,
            &policy,
        );

        info!(
            verdict = %report.verdict,
            returncode = report.returncode,
            output_bytes = report.combined_output.len(),
            "execution finished"
        );
        report
    }

    /// Run the user code through the capture driver and read what it exported
    async fn run_user_code(&self, request: &ExecutionRequest) -> (CapturedRun, CaptureManifest) {
        let capture_file = match self.capture_file() {
            Ok(file) => file,
            Err(e) => {
                warn!(error = %e, "failed to create capture file");
                return (
                    CapturedRun::transport(format!("failed to create capture file: {e}")),
                    CaptureManifest::default(),
                );
            }
        };

        let script = user_script(
            request.user_code(),
            &self.config.script_label,
            capture_file.path(),
        );
        let run = self.runner.run(&script, request.timeout()).await;

        let capture = if run.is_clean() {
            CaptureManifest::read(capture_file.path())
        } else {
            CaptureManifest::default()
        };

        if let Err(e) = capture_file.close() {
            warn!(error = %e, "failed to remove capture file");
        }
        (run, capture)
    }

    fn capture_file(&self) -> std::io::Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("pybox-capture-").suffix(".json");
        match &self.config.temp_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
    }
}
