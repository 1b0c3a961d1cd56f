// Sandbox module - out-of-process execution of untrusted Python submissions
#![allow(unused_imports)]

pub mod bridge;
pub mod classify;
pub mod config;
pub mod error;
pub mod lint;
pub mod runner;
pub mod service;
pub mod types;

pub use config::{LintConfig, SandboxConfig};
pub use error::{Result, SandboxError};
pub use runner::{ProcessRunner, ScriptRunner};
pub use service::Sandbox;
pub use types::{CapturedRun, ExecutionReport, ExecutionRequest, Language, Verdict};
