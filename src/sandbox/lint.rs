// Static checker: advisory diagnostics that never affect the verdict
#![allow(dead_code)]

use crate::sandbox::classify::timeout_message;
use crate::sandbox::config::LintConfig;
use crate::sandbox::runner::ScriptRunner;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Returned when the checker ran and had nothing to say
pub const CLEAN_LINT_MESSAGE: &str = "No issues found.";

/// Runs the configured linter over submitted code
pub struct Linter {
    runner: Arc<dyn ScriptRunner>,
    config: LintConfig,
}

impl Linter {
    pub fn new(runner: Arc<dyn ScriptRunner>, config: LintConfig) -> Self {
        Self { runner, config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Lint `script`. Never fails: an unusable linter is reported as text.
    pub async fn lint(&self, script: &str) -> String {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let run = self
            .runner
            .run_program(&self.config.program, &self.config.args, script, timeout)
            .await;

        if let Some(reason) = run.transport_error {
            warn!(program = %self.config.program, reason = %reason, "linter could not start");
            return format!("Linter unavailable: {reason}");
        }

        if run.timed_out {
            warn!(program = %self.config.program, "linter timed out");
            return format!("Linter {}", timeout_message(timeout).to_lowercase());
        }

        // `python3 -m <linter>` without the module installed
        if run.exit_code != 0 && run.stdout.is_empty() && run.stderr.contains("No module named") {
            let reason = run.stderr.trim().lines().last().unwrap_or_default();
            warn!(program = %self.config.program, reason = %reason, "linter module missing");
            return format!("Linter unavailable: {reason}");
        }

        let mut output = run.stdout;
        output.push_str(&run.stderr);

        debug!(
            exit_code = run.exit_code,
            output_bytes = output.len(),
            "linter finished"
        );

        if output.trim().is_empty() {
            CLEAN_LINT_MESSAGE.to_string()
        } else {
            output
        }
    }
}
