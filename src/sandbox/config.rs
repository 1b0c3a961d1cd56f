// Sandbox configuration
#![allow(dead_code)]

use crate::sandbox::error::{Result, SandboxError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Default config file looked up when `PYBOX_CONFIG` is unset
pub const DEFAULT_CONFIG_FILE: &str = "pybox.toml";

/// Sandbox configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Interpreter executable, resolved through `PATH`
    pub interpreter: String,
    /// Arguments placed before the script path
    pub interpreter_args: Vec<String>,
    /// Timeout applied when a request does not carry one
    pub default_timeout_secs: u64,
    /// Upper bound accepted from a request
    pub max_timeout_secs: u64,
    /// How long to wait for a killed process to be reaped
    pub kill_grace_ms: u64,
    /// Cap per captured stream
    pub max_output_bytes: usize,
    /// Where script artifacts are created (system temp dir when unset)
    pub temp_dir: Option<PathBuf>,
    /// Name substituted for the artifact path in captured output, and the
    /// file name user code is compiled under
    pub script_label: String,
    /// File name test code is compiled under
    pub test_label: String,
    /// Substring identifying a failed assertion in test output
    pub assertion_marker: String,
    /// Appended to the output when a test run passes; empty disables it
    pub pass_banner: String,
    /// Static checker settings
    pub lint: LintConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: String::from("python3"),
            interpreter_args: vec![String::from("-u")],
            default_timeout_secs: 5,
            max_timeout_secs: 30,
            kill_grace_ms: 500,
            max_output_bytes: 1048576, // 1MB
            temp_dir: None,
            script_label: String::from("main.py"),
            test_label: String::from("test.py"),
            assertion_marker: String::from("AssertionError"),
            pass_banner: String::from("\n--- Test Passed! ---\n"),
            lint: LintConfig::default(),
        }
    }
}

/// Static checker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LintConfig {
    pub enabled: bool,
    /// Linter executable
    pub program: String,
    /// Arguments placed before the script path
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for LintConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: String::from("python3"),
            args: vec![String::from("-m"), String::from("pyflakes")],
            timeout_secs: 5,
        }
    }
}

/// Parse an override, logging a warning if the value is present but invalid.
fn parse_override<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    current: T,
) -> T {
    match lookup(name) {
        Some(v) => match v.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(var = name, value = %v, "Invalid env var value, using default");
                current
            }
        },
        None => current,
    }
}

impl SandboxConfig {
    /// Load from `pybox.toml` (or `PYBOX_CONFIG`) and environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = std::env::var("PYBOX_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut config = Self::from_file(&path)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML config file; a missing file yields the defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), "loaded sandbox config from file");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `PYBOX_*` overrides from `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(interpreter) = lookup("PYBOX_INTERPRETER") {
            self.interpreter = interpreter;
        }
        self.default_timeout_secs =
            parse_override(&lookup, "PYBOX_DEFAULT_TIMEOUT_SECS", self.default_timeout_secs);
        self.max_timeout_secs =
            parse_override(&lookup, "PYBOX_MAX_TIMEOUT_SECS", self.max_timeout_secs);
        self.kill_grace_ms = parse_override(&lookup, "PYBOX_KILL_GRACE_MS", self.kill_grace_ms);
        self.max_output_bytes =
            parse_override(&lookup, "PYBOX_MAX_OUTPUT_BYTES", self.max_output_bytes);
        if let Some(dir) = lookup("PYBOX_TEMP_DIR") {
            self.temp_dir = Some(PathBuf::from(dir));
        }
        self.lint.enabled = parse_override(&lookup, "PYBOX_LINT_ENABLED", self.lint.enabled);
        if let Some(program) = lookup("PYBOX_LINT_PROGRAM") {
            self.lint.program = program;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.interpreter.trim().is_empty() {
            return Err(SandboxError::ConfigInvalid("interpreter is empty".into()));
        }
        if self.script_label.trim().is_empty() || self.test_label.trim().is_empty() {
            return Err(SandboxError::ConfigInvalid("script labels must not be empty".into()));
        }
        if self.default_timeout_secs == 0 {
            return Err(SandboxError::ConfigInvalid(
                "default_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.max_timeout_secs < self.default_timeout_secs {
            return Err(SandboxError::ConfigInvalid(format!(
                "max_timeout_secs ({}) is below default_timeout_secs ({})",
                self.max_timeout_secs, self.default_timeout_secs
            )));
        }
        if self.max_output_bytes == 0 {
            return Err(SandboxError::ConfigInvalid(
                "max_output_bytes must be greater than zero".into(),
            ));
        }
        if self.lint.enabled && self.lint.timeout_secs == 0 {
            return Err(SandboxError::ConfigInvalid(
                "lint.timeout_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn pass_banner(&self) -> Option<&str> {
        Some(self.pass_banner.as_str()).filter(|b| !b.is_empty())
    }
}
