// Data types for Sandbox module
#![allow(dead_code)]

use crate::sandbox::error::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Exit code reported for a run that was killed by the wall-clock timer
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// Languages the sandbox can execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Python,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
        }
    }
}

impl FromStr for Language {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "python" => Ok(Language::Python),
            other => Err(SandboxError::UnsupportedLanguage(other.to_string())),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated request to execute user code and an optional test script.
///
/// Only constructible through [`ExecutionRequest::new`], so a request in
/// hand always has a positive timeout and a supported language.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    user_code: String,
    test_code: Option<String>,
    timeout: Duration,
    language: Language,
}

impl ExecutionRequest {
    pub fn new(
        user_code: impl Into<String>,
        test_code: Option<String>,
        timeout: Duration,
        language: Language,
    ) -> Result<Self> {
        if timeout.is_zero() {
            return Err(SandboxError::InvalidTimeout(0));
        }

        // Blank test code means "no test"
        let test_code = test_code.filter(|t| !t.trim().is_empty());

        Ok(Self {
            user_code: user_code.into(),
            test_code,
            timeout,
            language,
        })
    }

    pub fn user_code(&self) -> &str {
        &self.user_code
    }

    pub fn test_code(&self) -> Option<&str> {
        self.test_code.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn language(&self) -> Language {
        self.language
    }
}

/// Everything observed from one script execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapturedRun {
    pub stdout: String,
    pub stderr: String,
    /// Real exit status, `-N` when killed by signal N, `-1` on timeout
    pub exit_code: i32,
    pub timed_out: bool,
    /// Set when the process could not be started at all
    pub transport_error: Option<String>,
}

impl CapturedRun {
    /// A run that never started
    pub fn transport(reason: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: TIMEOUT_EXIT_CODE,
            timed_out: false,
            transport_error: Some(reason.into()),
        }
    }

    /// True when the process exited 0 within its budget
    pub fn exited_cleanly(&self) -> bool {
        self.transport_error.is_none() && !self.timed_out && self.exit_code == 0
    }

    /// User runs are stricter: anything written to stderr counts as failure
    pub fn is_clean(&self) -> bool {
        self.exited_cleanly() && self.stderr.is_empty()
    }

    /// Whether either stream contains `marker`
    pub fn mentions(&self, marker: &str) -> bool {
        !marker.is_empty() && (self.stdout.contains(marker) || self.stderr.contains(marker))
    }
}

/// Terminal classification of an execution request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Success,
    /// Submitted but never graded; only assigned outside the classifier
    Attempted,
    Error,
    TestFailed,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Success => "success",
            Verdict::Attempted => "attempted",
            Verdict::Error => "error",
            Verdict::TestFailed => "test_failed",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only object handed back across the service boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    /// User stdout followed by test stdout
    pub combined_output: String,
    /// Raw stderr of every run that executed, user first
    pub combined_stderr: String,
    /// Human-readable failure text; `None` on a clean success
    pub combined_error: Option<String>,
    pub verdict: Verdict,
    pub lint_output: Option<String>,
    /// Exit code of the last run that executed
    pub returncode: i32,
}

impl ExecutionReport {
    /// Report for a request rejected before any process was spawned
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            combined_output: String::new(),
            combined_stderr: String::new(),
            combined_error: Some(reason.into()),
            verdict: Verdict::Error,
            lint_output: None,
            returncode: TIMEOUT_EXIT_CODE,
        }
    }
}
