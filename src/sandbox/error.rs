// Error types for Sandbox module
#![allow(dead_code)]

use thiserror::Error;

/// Sandbox error types
///
/// These are request-level failures raised before any process exists.
/// Faults of a running script (crash, timeout, spawn failure) are data
/// inside `CapturedRun`, never errors.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Invalid timeout: {0} seconds (must be greater than zero)")]
    InvalidTimeout(u64),

    #[error("Timeout of {requested} seconds exceeds the maximum of {max} seconds")]
    TimeoutTooLarge { requested: u64, max: u64 },

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
